//! Full-population risk scan.
//!
//! Fetches every margin account of the exchange, classifies each against a
//! [`RiskSnapshot`] and flags at-risk accounts that have no deadline yet.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, instrument, warn};

use liquidator_chain::{
    fetch_account, AccountSchema, ChainClient, Exchange, MarginAccount, TransactionSender,
    MARGIN_ACCOUNT_SIZE,
};

use crate::deadline_tracker::{Deadline, RiskEntry};
use crate::risk::RiskSnapshot;

/// Outcome of one full scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// At-risk accounts, ascending by deadline
    pub entries: Vec<RiskEntry>,
    /// Accounts decoded and found healthy
    pub healthy: Vec<Pubkey>,
    /// Accounts fetched
    pub scanned: usize,
    /// Accounts skipped on a decode or math error
    pub errored: usize,
    /// At-risk accounts newly assigned a deadline
    pub marked: usize,
}

pub struct RiskScanner {
    chain: Arc<dyn ChainClient>,
    sender: Arc<TransactionSender>,
    exchange: Exchange,
    /// Concurrent deadline-assignment transactions
    concurrency: usize,
    dry_run: bool,
}

impl RiskScanner {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        sender: Arc<TransactionSender>,
        exchange: Exchange,
        concurrency: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            chain,
            sender,
            exchange,
            concurrency: concurrency.max(1),
            dry_run,
        }
    }

    #[instrument(skip_all)]
    pub async fn scan(&self, snapshot: &RiskSnapshot) -> Result<ScanReport> {
        let fetch_start = Instant::now();
        let slot = self.chain.get_slot().await?;
        let accounts = self
            .chain
            .get_program_accounts_by_size(&self.exchange.program_id, MARGIN_ACCOUNT_SIZE)
            .await
            .context("fetching margin accounts")?;
        info!(
            count = accounts.len(),
            slot,
            fetch_ms = fetch_start.elapsed().as_millis(),
            "Fetched margin accounts"
        );

        let classify_start = Instant::now();
        let mut report = ScanReport {
            scanned: accounts.len(),
            ..Default::default()
        };
        let mut unset = Vec::new();

        for (address, account) in &accounts {
            let margin = match MarginAccount::decode(&account.data) {
                Ok(margin) => margin,
                Err(e) => {
                    warn!(address = %address, error = %e, "Skipping undecodable account");
                    report.errored += 1;
                    continue;
                }
            };

            match snapshot.classify(&margin) {
                Ok(class) if class.at_risk => {
                    debug!(
                        address = %address,
                        user_debt = class.user_debt,
                        user_max_debt = class.user_max_debt,
                        "Account at risk"
                    );
                    match margin.deadline() {
                        Some(deadline) => report.entries.push(RiskEntry::new(
                            *address,
                            Deadline::At(deadline),
                            slot,
                        )),
                        None => unset.push(*address),
                    }
                }
                Ok(_) => report.healthy.push(*address),
                Err(e) => {
                    warn!(address = %address, error = %e, "Skipping unclassifiable account");
                    report.errored += 1;
                }
            }
        }

        info!(
            at_risk = report.entries.len() + unset.len(),
            unset = unset.len(),
            healthy = report.healthy.len(),
            errored = report.errored,
            classify_ms = classify_start.elapsed().as_millis(),
            "Classified margin accounts"
        );

        let marked: Vec<(Pubkey, Result<RiskEntry>)> = stream::iter(unset)
            .map(|address| async move { (address, self.mark(snapshot, address, slot).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (address, result) in marked {
            match result {
                Ok(entry) => {
                    if entry.deadline != Deadline::Unset {
                        report.marked += 1;
                    }
                    report.entries.push(entry);
                }
                Err(e) => {
                    // Stays unset; the next scan tries again
                    warn!(address = %address, error = format!("{e:#}"), "Deadline assignment failed");
                    report.entries.push(RiskEntry::new(address, Deadline::Unset, slot));
                }
            }
        }

        report
            .entries
            .sort_by(|a, b| (a.deadline, a.address).cmp(&(b.deadline, b.address)));

        info!(
            at_risk = report.entries.len(),
            marked = report.marked,
            total_ms = fetch_start.elapsed().as_millis(),
            "Scan complete"
        );
        Ok(report)
    }

    /// Ask the exchange to assign a deadline to `address`, then read it back.
    async fn mark(&self, snapshot: &RiskSnapshot, address: Pubkey, scan_slot: u64) -> Result<RiskEntry> {
        if self.dry_run {
            info!(address = %address, "Dry run: not assigning deadline");
            return Ok(RiskEntry::new(address, Deadline::Unset, scan_slot));
        }

        let ix = self
            .exchange
            .check_account_instruction(&snapshot.assets_list_address, &address);
        self.sender.send(&[ix]).await?;

        let slot = self.chain.get_slot().await?;
        let margin: MarginAccount = fetch_account(self.chain.as_ref(), &address).await?;
        let deadline = Deadline::from_raw(margin.liquidation_deadline);
        debug!(address = %address, deadline = ?deadline, "Deadline assigned");
        Ok(RiskEntry::new(address, deadline, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests::{account, assets_list};
    use liquidator_chain::exchange::instructions::{decode_instruction_name, CHECK_ACCOUNT};
    use liquidator_chain::mock::MockChain;
    use liquidator_chain::{ExchangeState, DEADLINE_UNSET};
    use solana_sdk::signature::Keypair;
    use solana_sdk::transaction::Transaction;

    struct Fixture {
        chain: Arc<MockChain>,
        exchange: Exchange,
        snapshot: RiskSnapshot,
    }

    fn fixture(stable_supply: u128) -> Fixture {
        let state = ExchangeState {
            debt_shares: 1_000,
            ..Default::default()
        };
        Fixture {
            chain: Arc::new(MockChain::new()),
            exchange: Exchange::new(Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique()),
            snapshot: RiskSnapshot::new(
                Arc::new(state),
                assets_list(stable_supply),
                Pubkey::new_unique(),
            )
            .unwrap(),
        }
    }

    impl Fixture {
        fn scanner(&self, dry_run: bool) -> RiskScanner {
            let sender = Arc::new(TransactionSender::new(self.chain.clone(), Keypair::new()));
            RiskScanner::new(self.chain.clone(), sender, self.exchange, 4, dry_run)
        }

        fn add(&self, margin: &MarginAccount) -> Pubkey {
            let address = Pubkey::new_unique();
            self.chain
                .insert_account(address, self.exchange.program_id, margin.encode());
            address
        }
    }

    /// Deadline-assignment instructions set the target's deadline to `deadline`.
    fn assign_deadlines(chain: &MockChain, tx: &Transaction, deadline: u64) -> Result<()> {
        for ix in &tx.message.instructions {
            if decode_instruction_name(&ix.data) != Some(CHECK_ACCOUNT) {
                continue;
            }
            let target = tx.message.account_keys[ix.accounts[1] as usize];
            let data = chain.account_data(&target).context("unknown account")?;
            let mut margin = MarginAccount::decode(&data)?;
            margin.liquidation_deadline = deadline;
            let owner = tx.message.account_keys[ix.program_id_index as usize];
            chain.insert_account(target, owner, margin.encode());
        }
        Ok(())
    }

    fn with_deadline(mut margin: MarginAccount, deadline: u64) -> MarginAccount {
        margin.liquidation_deadline = deadline;
        margin
    }

    #[tokio::test]
    async fn test_scan_classifies_and_orders() {
        // 500 debt against 400 max debt for a full-share account
        let fx = fixture(500);
        let late = fx.add(&with_deadline(account(1_000, 400), 90));
        let early = fx.add(&with_deadline(account(1_000, 400), 20));
        let healthy = fx.add(&with_deadline(account(1_000, 10_000), 5));
        let no_debt = fx.add(&with_deadline(account(0, 0), DEADLINE_UNSET));

        let report = fx.scanner(false).scan(&fx.snapshot).await.unwrap();

        assert_eq!(report.scanned, 4);
        let order: Vec<Pubkey> = report.entries.iter().map(|e| e.address).collect();
        assert_eq!(order, vec![early, late]);
        assert!(report.healthy.contains(&healthy));
        assert!(report.healthy.contains(&no_debt));
        assert_eq!(report.marked, 0);
        assert!(fx.chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_scan_skips_undecodable_accounts() {
        let fx = fixture(500);
        let good = fx.add(&with_deadline(account(1_000, 400), 20));
        // Right size, wrong discriminator
        fx.chain.insert_account(
            Pubkey::new_unique(),
            fx.exchange.program_id,
            vec![7u8; MARGIN_ACCOUNT_SIZE as usize],
        );

        let report = fx.scanner(false).scan(&fx.snapshot).await.unwrap();
        assert_eq!(report.errored, 1);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].address, good);
    }

    #[tokio::test]
    async fn test_scan_marks_unset_accounts() {
        let fx = fixture(500);
        fx.chain.set_slot(1_000);
        fx.chain
            .on_send(|chain, tx| assign_deadlines(chain, tx, 1_050));
        let unset = fx.add(&with_deadline(account(1_000, 400), DEADLINE_UNSET));

        let report = fx.scanner(false).scan(&fx.snapshot).await.unwrap();

        assert_eq!(report.marked, 1);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].address, unset);
        assert_eq!(report.entries[0].deadline, Deadline::At(1_050));
        assert_eq!(fx.chain.sent_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_marking_keeps_account_unset() {
        let fx = fixture(500);
        fx.chain.fail_sends(true);
        let unset = fx.add(&with_deadline(account(1_000, 400), DEADLINE_UNSET));
        let flagged = fx.add(&with_deadline(account(1_000, 400), 7));

        let report = fx.scanner(false).scan(&fx.snapshot).await.unwrap();

        assert_eq!(report.marked, 0);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].address, flagged);
        assert_eq!(report.entries[1].address, unset);
        assert_eq!(report.entries[1].deadline, Deadline::Unset);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let fx = fixture(500);
        fx.add(&with_deadline(account(1_000, 400), DEADLINE_UNSET));

        let report = fx.scanner(true).scan(&fx.snapshot).await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.marked, 0);
        assert!(fx.chain.sent_transactions().is_empty());
    }
}
