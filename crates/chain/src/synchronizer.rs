//! Locally cached, push-updated copies of on-chain accounts.
//!
//! An [`AccountSynchronizer`] holds the latest decoded value of one account.
//! It is seeded either with a known value or by one fetch, then kept current
//! by a subscription that re-decodes every notification. Readers never block
//! on the network; they may observe a value that is one update behind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::RwLock;
use solana_sdk::account::Account;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::provider::{AccountStream, ChainClient};

/// Delay before re-subscribing after a subscription stream ends.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// A typed on-chain account layout.
pub trait AccountSchema: Sized + Send + Sync + 'static {
    /// Layout name used in logs and errors.
    const NAME: &'static str;

    fn decode(data: &[u8]) -> Result<Self, DecodeError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{schema}: account data too short ({len} bytes)")]
    Truncated { schema: &'static str, len: usize },
    #[error("{schema}: discriminator mismatch")]
    Discriminator { schema: &'static str },
    #[error("{schema}: {reason}")]
    Corrupt { schema: &'static str, reason: String },
}

/// How a synchronizer obtains its first value.
pub enum Seed<T> {
    /// Use this value; no fetch is issued.
    Known(T),
    /// Fetch the account once at construction.
    Fetch,
}

/// Fetch `address` and decode it as `T`.
pub async fn fetch_account<T: AccountSchema>(chain: &dyn ChainClient, address: &Pubkey) -> Result<T> {
    let account = chain
        .get_account(address)
        .await
        .with_context(|| format!("fetching {} {}", T::NAME, address))?;
    Ok(T::decode(&account.data)?)
}

/// Re-subscribes whenever `stream` ends and feeds every account update to
/// `on_update`. Runs until the task is aborted.
pub(crate) async fn follow_account<F>(
    chain: Arc<dyn ChainClient>,
    address: Pubkey,
    mut stream: AccountStream,
    mut on_update: F,
) where
    F: FnMut(&Account) + Send,
{
    loop {
        while let Some(account) = stream.next().await {
            on_update(&account);
        }

        warn!(
            address = %address,
            delay_secs = RESUBSCRIBE_DELAY.as_secs(),
            "Account subscription ended, resubscribing"
        );
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;

        match chain.subscribe_account(&address).await {
            Ok(next) => stream = next,
            Err(e) => warn!(address = %address, error = %e, "Resubscribe failed"),
        }
    }
}

struct Shared<T> {
    value: RwLock<Arc<T>>,
    last_error: RwLock<Option<DecodeError>>,
    /// Bumped once per processed notification, decoded or not
    notifications: watch::Sender<u64>,
}

impl<T: AccountSchema> Shared<T> {
    fn apply(&self, address: &Pubkey, data: &[u8]) {
        match T::decode(data) {
            Ok(value) => {
                *self.value.write() = Arc::new(value);
                *self.last_error.write() = None;
                debug!(schema = T::NAME, address = %address, "Account updated");
            }
            Err(e) => {
                warn!(
                    schema = T::NAME,
                    address = %address,
                    error = %e,
                    "Undecodable account update, keeping previous value"
                );
                *self.last_error.write() = Some(e);
            }
        }
        self.notifications.send_modify(|n| *n += 1);
    }
}

/// Latest decoded value of one account.
pub struct AccountSynchronizer<T> {
    address: Pubkey,
    chain: Arc<dyn ChainClient>,
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

impl<T: AccountSchema> AccountSynchronizer<T> {
    /// Start tracking `address`. The subscription is acknowledged before the
    /// initial fetch so no write between the two is lost; a failed
    /// subscription is returned as an error.
    pub async fn new(chain: Arc<dyn ChainClient>, address: Pubkey, seed: Seed<T>) -> Result<Self> {
        let stream = chain
            .subscribe_account(&address)
            .await
            .with_context(|| format!("subscribing to {} {}", T::NAME, address))?;

        let initial = match seed {
            Seed::Known(value) => value,
            Seed::Fetch => fetch_account::<T>(chain.as_ref(), &address).await?,
        };

        let (notifications, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            value: RwLock::new(Arc::new(initial)),
            last_error: RwLock::new(None),
            notifications,
        });

        let task = {
            let shared = shared.clone();
            tokio::spawn(follow_account(chain.clone(), address, stream, move |account| {
                shared.apply(&address, &account.data)
            }))
        };

        Ok(Self {
            address,
            chain,
            shared,
            task,
        })
    }

    pub fn address(&self) -> Pubkey {
        self.address
    }

    /// Latest decoded value.
    pub fn get(&self) -> Arc<T> {
        self.shared.value.read().clone()
    }

    /// Decode failure of the most recent notification, cleared by the next
    /// successful update.
    pub fn last_error(&self) -> Option<DecodeError> {
        self.shared.last_error.read().clone()
    }

    /// Feed raw account data as if it arrived from the subscription.
    pub fn apply(&self, data: &[u8]) {
        self.shared.apply(&self.address, data);
    }

    /// Fetch the account now and replace the cached value.
    pub async fn refresh(&self) -> Result<Arc<T>> {
        let value = Arc::new(fetch_account::<T>(self.chain.as_ref(), &self.address).await?);
        *self.shared.value.write() = value.clone();
        Ok(value)
    }

    /// Receiver that changes once per processed notification.
    pub fn notifications(&self) -> watch::Receiver<u64> {
        self.shared.notifications.subscribe()
    }
}

impl<T> Drop for AccountSynchronizer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
