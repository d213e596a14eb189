//! In-memory ledger implementing [`ChainClient`], for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc::{self, UnboundedSender};
use parking_lot::{Mutex, RwLock};
use solana_sdk::account::Account;
use solana_sdk::clock::Slot;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;

use crate::provider::{AccountStream, ChainClient};

type SendHook = Box<dyn Fn(&MockChain, &Transaction) -> Result<()> + Send + Sync>;

/// Accounts, slot and submitted transactions held in memory.
///
/// Writes made through [`MockChain::push_update`] are delivered to account
/// subscribers; [`MockChain::insert_account`] changes state silently.
#[derive(Default)]
pub struct MockChain {
    accounts: DashMap<Pubkey, Account>,
    slot: AtomicU64,
    fetches: AtomicUsize,
    program_queries: AtomicUsize,
    sent: Mutex<Vec<Transaction>>,
    subscribers: DashMap<Pubkey, Vec<UnboundedSender<Account>>>,
    send_hook: RwLock<Option<SendHook>>,
    fail_sends: AtomicBool,
    fail_subscribes: AtomicBool,
    program_query_delay: Mutex<Option<Duration>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an account without notifying subscribers.
    pub fn insert_account(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        self.accounts.insert(
            address,
            Account {
                lamports: 1_000_000,
                data,
                owner,
                executable: false,
                rent_epoch: 0,
            },
        );
    }

    /// Store an account and notify its subscribers.
    pub fn push_update(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        self.insert_account(address, owner, data);
        let Some(account) = self.accounts.get(&address).map(|a| a.clone()) else {
            return;
        };
        if let Some(mut senders) = self.subscribers.get_mut(&address) {
            senders.retain(|tx| tx.unbounded_send(account.clone()).is_ok());
        }
    }

    pub fn remove_account(&self, address: &Pubkey) {
        self.accounts.remove(address);
    }

    pub fn account_data(&self, address: &Pubkey) -> Option<Vec<u8>> {
        self.accounts.get(address).map(|a| a.data.clone())
    }

    pub fn set_slot(&self, slot: Slot) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    /// Number of single-account fetches served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of program-account queries served.
    pub fn program_query_count(&self) -> usize {
        self.program_queries.load(Ordering::SeqCst)
    }

    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.sent.lock().clone()
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Hold every program-account query for `delay` before answering.
    pub fn delay_program_queries(&self, delay: Duration) {
        *self.program_query_delay.lock() = Some(delay);
    }

    /// Make every subsequent subscription attempt fail.
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// End every open subscription stream, as a dropped connection does.
    pub fn close_subscriptions(&self) {
        self.subscribers.clear();
    }

    /// Run `hook` on every accepted transaction. The hook can mutate ledger
    /// state; an error from it fails the send.
    pub fn on_send<F>(&self, hook: F)
    where
        F: Fn(&MockChain, &Transaction) -> Result<()> + Send + Sync + 'static,
    {
        *self.send_hook.write() = Some(Box::new(hook));
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_account_opt(&self, address: &Pubkey) -> Result<Option<Account>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.get(address).map(|a| a.clone()))
    }

    async fn get_program_accounts_by_size(
        &self,
        program_id: &Pubkey,
        data_size: u64,
    ) -> Result<Vec<(Pubkey, Account)>> {
        self.program_queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.program_query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .accounts
            .iter()
            .filter(|e| e.owner == *program_id && e.data.len() as u64 == data_size)
            .map(|e| (*e.key(), e.value().clone()))
            .collect())
    }

    async fn get_slot(&self) -> Result<Slot> {
        Ok(self.slot.load(Ordering::SeqCst))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(Hash::new_unique())
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("transaction rejected");
        }
        if let Some(hook) = self.send_hook.read().as_ref() {
            hook(self, transaction)?;
        }
        self.sent.lock().push(transaction.clone());
        Ok(transaction.signatures.first().copied().unwrap_or_default())
    }

    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountStream> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            bail!("websocket closed");
        }
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.entry(*address).or_default().push(tx);
        Ok(Box::pin(rx))
    }
}
