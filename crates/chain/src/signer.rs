//! Transaction signer and sender.
//!
//! Every transaction is signed by the liquidator wallet, which is also the
//! fee payer. An optional compute-unit price is prepended to each bundle.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, warn};

use crate::provider::ChainClient;

/// Signs instruction bundles with the liquidator wallet and submits them.
pub struct TransactionSender {
    chain: Arc<dyn ChainClient>,
    keypair: Keypair,
    /// Micro-lamports per compute unit, if a priority fee is paid
    priority_fee: Option<u64>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl TransactionSender {
    pub fn new(chain: Arc<dyn ChainClient>, keypair: Keypair) -> Self {
        info!(wallet = %keypair.pubkey(), "Transaction sender initialized");
        Self {
            chain,
            keypair,
            priority_fee: None,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Load the wallet keypair from a JSON keypair file.
    pub fn from_file(chain: Arc<dyn ChainClient>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let keypair = read_keypair_file(path)
            .map_err(|e| anyhow!("reading keypair {}: {e}", path.display()))?;
        Ok(Self::new(chain, keypair))
    }

    /// Pay `micro_lamports` per compute unit on every transaction. Zero disables it.
    pub fn with_priority_fee(mut self, micro_lamports: u64) -> Self {
        self.priority_fee = (micro_lamports > 0).then_some(micro_lamports);
        self
    }

    /// Wallet address.
    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Sign `instructions` into one transaction against `blockhash`.
    pub fn build(&self, instructions: &[Instruction], blockhash: Hash) -> Transaction {
        let mut bundle = Vec::with_capacity(instructions.len() + 1);
        if let Some(micro_lamports) = self.priority_fee {
            bundle.push(ComputeBudgetInstruction::set_compute_unit_price(micro_lamports));
        }
        bundle.extend_from_slice(instructions);

        Transaction::new_signed_with_payer(
            &bundle,
            Some(&self.keypair.pubkey()),
            &[&self.keypair],
            blockhash,
        )
    }

    /// Sign and submit `instructions` as one atomic transaction.
    pub async fn send(&self, instructions: &[Instruction]) -> Result<Signature> {
        let start = Instant::now();

        let blockhash = self.chain.get_latest_blockhash().await?;
        let transaction = self.build(instructions, blockhash);
        debug!(
            instructions = instructions.len(),
            priority_fee = ?self.priority_fee,
            "Sending transaction"
        );

        match self.chain.send_transaction(&transaction).await {
            Ok(signature) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                info!(
                    signature = %signature,
                    total_ms = start.elapsed().as_millis(),
                    "Transaction confirmed"
                );
                Ok(signature)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    total_ms = start.elapsed().as_millis(),
                    "Transaction failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChain;
    use solana_sdk::compute_budget;

    fn noop(program: Pubkey) -> Instruction {
        Instruction {
            program_id: program,
            accounts: vec![],
            data: vec![0],
        }
    }

    #[tokio::test]
    async fn test_send_signs_with_wallet() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain.clone(), Keypair::new());

        let signature = sender.send(&[noop(Pubkey::new_unique())]).await.unwrap();

        let sent = chain.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].signatures[0], signature);
        assert_eq!(sent[0].message.account_keys[0], sender.pubkey());
        assert_eq!(sender.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_is_counted() {
        let chain = Arc::new(MockChain::new());
        chain.fail_sends(true);
        let sender = TransactionSender::new(chain.clone(), Keypair::new());

        assert!(sender.send(&[noop(Pubkey::new_unique())]).await.is_err());
        assert_eq!(sender.failed_count(), 1);
        assert_eq!(sender.sent_count(), 0);
    }

    #[test]
    fn test_priority_fee_prepends_compute_budget() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain, Keypair::new()).with_priority_fee(5_000);
        let program = Pubkey::new_unique();

        let tx = sender.build(&[noop(program)], Hash::default());
        let programs: Vec<Pubkey> = tx
            .message
            .instructions
            .iter()
            .map(|ix| tx.message.account_keys[ix.program_id_index as usize])
            .collect();
        assert_eq!(programs, vec![compute_budget::id(), program]);
    }

    #[test]
    fn test_zero_priority_fee_disabled() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain, Keypair::new()).with_priority_fee(0);
        let tx = sender.build(&[noop(Pubkey::new_unique())], Hash::default());
        assert_eq!(tx.message.instructions.len(), 1);
    }
}
