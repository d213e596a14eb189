//! Ledger access.
//!
//! [`ChainClient`] is the narrow interface the agent consumes; [`RpcChainClient`]
//! implements it over Solana JSON-RPC and websocket pubsub.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{Stream, StreamExt};
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::RpcFilterType;
use solana_sdk::account::Account;
use solana_sdk::clock::Slot;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// Stream of raw account states, one item per confirmed write.
pub type AccountStream = Pin<Box<dyn Stream<Item = Account> + Send>>;

/// Ledger operations used by the agent.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetch an account, `None` if it does not exist.
    async fn get_account_opt(&self, address: &Pubkey) -> Result<Option<Account>>;

    /// Fetch every account owned by `program_id` whose data is exactly
    /// `data_size` bytes.
    async fn get_program_accounts_by_size(
        &self,
        program_id: &Pubkey,
        data_size: u64,
    ) -> Result<Vec<(Pubkey, Account)>>;

    /// Current slot at the client's commitment.
    async fn get_slot(&self) -> Result<Slot>;

    async fn get_latest_blockhash(&self) -> Result<Hash>;

    /// Submit `transaction` and wait until it lands at the client's commitment.
    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature>;

    /// Push notifications for every future write to `address`.
    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountStream>;

    /// Fetch an account that must exist.
    async fn get_account(&self, address: &Pubkey) -> Result<Account> {
        self.get_account_opt(address)
            .await?
            .with_context(|| format!("account {address} not found"))
    }
}

/// Websocket connection shared by every subscription, replaced when it dies.
struct Pubsub {
    ws_url: String,
    client: RwLock<Arc<PubsubClient>>,
}

impl Pubsub {
    async fn connect(ws_url: &str) -> Result<Arc<PubsubClient>> {
        let client = PubsubClient::new(ws_url)
            .await
            .with_context(|| format!("websocket connection to {ws_url} failed"))?;
        Ok(Arc::new(client))
    }

    async fn current(&self) -> Arc<PubsubClient> {
        self.client.read().await.clone()
    }

    /// Replace `stale` with a new connection. A no-op returning the current
    /// client when another caller already replaced it.
    async fn reconnect(&self, stale: &Arc<PubsubClient>) -> Result<Arc<PubsubClient>> {
        let mut client = self.client.write().await;
        if !Arc::ptr_eq(&*client, stale) {
            return Ok(client.clone());
        }

        warn!(ws = %self.ws_url, "Reconnecting websocket");
        let fresh = Self::connect(&self.ws_url).await?;
        *client = fresh.clone();
        info!(ws = %self.ws_url, "Websocket reconnected");
        Ok(fresh)
    }
}

/// [`ChainClient`] over a Solana RPC node.
pub struct RpcChainClient {
    rpc: RpcClient,
    pubsub: Arc<Pubsub>,
    commitment: CommitmentConfig,
}

impl RpcChainClient {
    /// Connect to the HTTP and websocket endpoints and verify the node answers.
    pub async fn connect(http_url: &str, ws_url: &str, commitment: CommitmentConfig) -> Result<Self> {
        info!(
            http = http_url,
            ws = ws_url,
            commitment = ?commitment.commitment,
            "Connecting to RPC node"
        );

        let rpc = RpcClient::new_with_commitment(http_url.to_string(), commitment);
        let slot = rpc.get_slot().await.context("RPC connection check failed")?;
        info!(slot, "RPC connection verified");

        let client = Pubsub::connect(ws_url).await?;

        Ok(Self {
            rpc,
            pubsub: Arc::new(Pubsub {
                ws_url: ws_url.to_string(),
                client: RwLock::new(client),
            }),
            commitment,
        })
    }

    fn account_config(&self) -> RpcAccountInfoConfig {
        RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(self.commitment),
            ..Default::default()
        }
    }

    /// Subscribe to `address` on `client`. Returns once the node has
    /// acknowledged the subscription; notifications are forwarded by a task
    /// that owns the subscription.
    async fn open_stream(&self, client: Arc<PubsubClient>, address: Pubkey) -> Result<AccountStream> {
        let (tx, rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let pubsub = self.pubsub.clone();
        let config = self.account_config();

        tokio::spawn(async move {
            let (mut stream, unsubscribe) =
                match client.account_subscribe(&address, Some(config)).await {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(e)));
                        return;
                    }
                };

            let mut receiver_dropped = false;
            while let Some(response) = stream.next().await {
                let Some(account) = response.value.decode::<Account>() else {
                    warn!(address = %address, "Undecodable account notification");
                    continue;
                };
                if tx.unbounded_send(account).is_err() {
                    receiver_dropped = true;
                    break;
                }
            }

            unsubscribe().await;

            // The node closed the stream, so the connection is gone
            if !receiver_dropped {
                if let Err(e) = pubsub.reconnect(&client).await {
                    warn!(error = format!("{e:#}"), "Websocket reconnect failed");
                }
            }
        });

        ready_rx
            .await
            .context("subscription task ended before subscribing")?
            .with_context(|| format!("subscribing to {address}"))?;

        Ok(Box::pin(rx))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_account_opt(&self, address: &Pubkey) -> Result<Option<Account>> {
        let response = self
            .rpc
            .get_account_with_commitment(address, self.commitment)
            .await?;
        Ok(response.value)
    }

    async fn get_program_accounts_by_size(
        &self,
        program_id: &Pubkey,
        data_size: u64,
    ) -> Result<Vec<(Pubkey, Account)>> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![RpcFilterType::DataSize(data_size)]),
            account_config: self.account_config(),
            ..Default::default()
        };
        let accounts = self
            .rpc
            .get_program_accounts_with_config(program_id, config)
            .await?;
        debug!(program = %program_id, count = accounts.len(), "Fetched program accounts");
        Ok(accounts)
    }

    async fn get_slot(&self) -> Result<Slot> {
        Ok(self.rpc.get_slot().await?)
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(self.rpc.get_latest_blockhash().await?)
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature> {
        Ok(self.rpc.send_and_confirm_transaction(transaction).await?)
    }

    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountStream> {
        let client = self.pubsub.current().await;
        match self.open_stream(client.clone(), *address).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(address = %address, error = format!("{e:#}"), "Account subscription failed");
                let client = self.pubsub.reconnect(&client).await?;
                self.open_stream(client, *address).await
            }
        }
    }
}
