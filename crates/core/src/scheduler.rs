//! Scheduler driving the full-scan and at-risk cadences.
//!
//! Each cadence has its own next-due instant, re-armed only after its pass
//! completes. Between passes the loop sleeps until the earlier of the two.
//! All tracker writes happen on the scheduler task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use liquidator_chain::{
    AccountSynchronizer, AssetsList, ChainClient, Exchange, ExchangeState, PriceCache, Seed,
    TransactionSender,
};

use crate::config::BotConfig;
use crate::deadline_tracker::{Deadline, DeadlineTracker, MergeStats, RetryState, RiskEntry};
use crate::liquidator::{LiquidationOutcome, Liquidator, SkipReason};
use crate::risk::RiskSnapshot;
use crate::scanner::{RiskScanner, ScanReport};
use crate::wallet::LiquidatorWallet;

/// One periodic task.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    interval: Duration,
    next_due: Instant,
}

impl Cadence {
    /// Due immediately, then every `interval` after each completion.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: Instant::now(),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Schedule the next run one interval from now.
    pub fn rearm(&mut self) {
        self.next_due = Instant::now() + self.interval;
    }
}

/// Outcome counts of one at-risk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub slot: u64,
    /// Entries with a deadline at or before `slot`
    pub due: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Entries removed or dropped from the tracker
    pub removed: usize,
}

/// Background scan, aborted if the scheduler stops before it finishes.
struct ScanTask(JoinHandle<Result<ScanReport>>);

impl Drop for ScanTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Scheduler {
    chain: Arc<dyn ChainClient>,
    scanner: Arc<RiskScanner>,
    liquidator: Liquidator,
    tracker: DeadlineTracker,
    state: AccountSynchronizer<ExchangeState>,
    assets: AccountSynchronizer<AssetsList>,
    prices: PriceCache,
    wallet: Arc<LiquidatorWallet>,
    config: BotConfig,
}

impl Scheduler {
    /// Load exchange state, seed prices and provision the wallet.
    ///
    /// Any failure here is fatal: the agent cannot assess risk without the
    /// exchange state and a complete price set.
    pub async fn bootstrap(
        chain: Arc<dyn ChainClient>,
        sender: Arc<TransactionSender>,
        exchange: Exchange,
        config: BotConfig,
    ) -> Result<Self> {
        let state = AccountSynchronizer::<ExchangeState>::new(chain.clone(), exchange.state, Seed::Fetch)
            .await
            .context("loading exchange state")?;
        let assets_address = state.get().assets_list;
        let assets = AccountSynchronizer::<AssetsList>::new(chain.clone(), assets_address, Seed::Fetch)
            .await
            .context("loading assets list")?;

        let assets_list = assets.get();
        let prices = PriceCache::start(chain.clone(), &assets_list)
            .await
            .context("seeding oracle prices")?;

        let dry_run = config.liquidation.dry_run;
        let wallet = Arc::new(
            LiquidatorWallet::provision(chain.clone(), &sender, &assets_list, dry_run)
                .await
                .context("provisioning liquidator wallet")?,
        );
        wallet.warn_if_low(config.liquidation.min_stable_balance);

        let scanner = Arc::new(RiskScanner::new(
            chain.clone(),
            sender.clone(),
            exchange,
            config.scanner.scan_concurrency,
            dry_run,
        ));
        let liquidator = Liquidator::new(
            chain.clone(),
            sender,
            exchange,
            wallet.clone(),
            config.liquidation.amount_permille,
            dry_run,
        );

        info!(
            state = %exchange.state,
            assets_list = %assets_address,
            assets = assets_list.assets.len(),
            collaterals = assets_list.collaterals.len(),
            feeds = prices.feeds().len(),
            dry_run,
            "Bootstrap complete"
        );

        Ok(Self {
            chain,
            scanner,
            liquidator,
            tracker: DeadlineTracker::new(config.liquidation.max_attempts),
            state,
            assets,
            prices,
            wallet,
            config,
        })
    }

    pub fn tracker(&self) -> &DeadlineTracker {
        &self.tracker
    }

    pub fn wallet(&self) -> &LiquidatorWallet {
        &self.wallet
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    /// Current state with cached prices applied.
    pub fn snapshot(&self) -> Result<RiskSnapshot> {
        RiskSnapshot::capture(&self.state, &self.assets, &self.prices)
            .context("capturing risk snapshot")
    }

    fn warn_stale_prices(&self) {
        let Ok(max_age) = chrono::Duration::from_std(self.config.scanner.stale_price_warn()) else {
            return;
        };
        let stale = self.prices.stale_feeds(max_age, Utc::now());
        if !stale.is_empty() {
            warn!(assets = ?stale, max_age_secs = max_age.num_seconds(), "Oracle feeds silent");
        }
    }

    async fn scan(&self) -> Result<ScanReport> {
        let snapshot = self.snapshot()?;
        self.warn_stale_prices();
        self.scanner.scan(&snapshot).await
    }

    /// Run a scan on its own task. The report comes back through the handle
    /// and is merged by the caller.
    fn spawn_scan(&self) -> Result<JoinHandle<Result<ScanReport>>> {
        let snapshot = self.snapshot()?;
        self.warn_stale_prices();
        let scanner = self.scanner.clone();
        Ok(tokio::spawn(async move { scanner.scan(&snapshot).await }))
    }

    fn apply_scan(&self, report: &ScanReport) -> MergeStats {
        self.tracker.merge(&report.entries, &report.healthy)
    }

    /// Scan every margin account and merge the result into the tracker.
    #[instrument(skip_all)]
    pub async fn full_scan_pass(&self) -> Result<MergeStats> {
        let report = self.scan().await?;
        Ok(self.apply_scan(&report))
    }

    /// Attempt every tracked account whose deadline has passed.
    #[instrument(skip_all)]
    pub async fn at_risk_pass(&self) -> Result<PassReport> {
        let start = std::time::Instant::now();
        let slot = self.chain.get_slot().await.context("reading slot")?;
        let due = self.tracker.due(slot);

        let mut report = PassReport {
            slot,
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!(slot, tracked = self.tracker.len(), next = ?self.tracker.next_deadline(), "Nothing due");
            return Ok(report);
        }

        let snapshot = self.snapshot()?;
        let snapshot = &snapshot;
        let outcomes: Vec<(RiskEntry, LiquidationOutcome)> = stream::iter(due)
            .map(|entry| async move {
                let outcome = self.attempt(&entry, snapshot, slot).await;
                (entry, outcome)
            })
            .buffer_unordered(self.config.liquidation.liquidation_concurrency.max(1))
            .collect()
            .await;

        for (entry, outcome) in &outcomes {
            self.apply_outcome(entry, outcome, slot, &mut report);
        }

        info!(
            slot,
            due = report.due,
            submitted = report.submitted,
            skipped = report.skipped,
            failed = report.failed,
            removed = report.removed,
            tracked = self.tracker.len(),
            checking_ms = start.elapsed().as_millis(),
            "At-risk pass complete"
        );
        Ok(report)
    }

    async fn attempt(&self, entry: &RiskEntry, snapshot: &RiskSnapshot, slot: u64) -> LiquidationOutcome {
        let Some(_guard) = self.tracker.try_begin(entry.address) else {
            return LiquidationOutcome::Skipped(SkipReason::InFlight);
        };

        let balance = self.wallet.stable_balance();
        let outcome = self
            .liquidator
            .attempt(entry.address, snapshot, slot, balance)
            .await;

        if matches!(outcome, LiquidationOutcome::Submitted { .. }) {
            // Next attempt in this pass must see the spent balance
            if let Err(e) = self.wallet.refresh_balance().await {
                warn!(error = format!("{e:#}"), "Failed to refresh stable balance");
            }
        }
        outcome
    }

    fn apply_outcome(
        &self,
        entry: &RiskEntry,
        outcome: &LiquidationOutcome,
        slot: u64,
        report: &mut PassReport,
    ) {
        let address = &entry.address;
        match outcome {
            LiquidationOutcome::Submitted { .. } => {
                report.submitted += 1;
                self.tracker.record_success(address);
            }
            LiquidationOutcome::Failed(_) => {
                report.failed += 1;
                self.count_failure(address, report);
            }
            LiquidationOutcome::Skipped(reason) => {
                report.skipped += 1;
                match reason {
                    SkipReason::NotLiquidatable | SkipReason::NothingToRepay => {
                        self.tracker.remove(address);
                        report.removed += 1;
                    }
                    SkipReason::NoCollateral => self.count_failure(address, report),
                    SkipReason::DeadlineNotReached { deadline } => {
                        self.tracker
                            .update_deadline(address, Deadline::At(*deadline), slot);
                    }
                    SkipReason::DeadlineUnset => {
                        self.tracker.update_deadline(address, Deadline::Unset, slot);
                    }
                    SkipReason::EmptyWallet => {
                        warn!(address = %address, "Stable balance is empty, liquidation skipped");
                    }
                    SkipReason::InFlight | SkipReason::DryRun => {}
                }
            }
        }
    }

    fn count_failure(&self, address: &Pubkey, report: &mut PassReport) {
        match self.tracker.record_failure(address) {
            RetryState::Dropped => {
                warn!(address = %address, "Giving up on account until the next full scan");
                report.removed += 1;
            }
            RetryState::Retry { attempts } => {
                debug!(address = %address, attempts, "Will retry account");
            }
            RetryState::Untracked => {}
        }
    }

    /// Run both cadences until the process exits.
    pub async fn run(&self) -> Result<()> {
        let mut full_scan = Cadence::new(self.config.scanner.full_scan_interval());
        let mut at_risk = Cadence::new(self.config.scanner.at_risk_interval());
        let background = self.config.scanner.background_full_scan;
        let mut scan_in_flight: Option<ScanTask> = None;

        info!(
            full_scan_secs = self.config.scanner.full_scan_interval_secs,
            at_risk_ms = self.config.scanner.at_risk_interval_ms,
            background,
            "Scheduler running"
        );

        loop {
            if scan_in_flight.is_none() && full_scan.is_due(Instant::now()) {
                if background {
                    match self.spawn_scan() {
                        Ok(handle) => scan_in_flight = Some(ScanTask(handle)),
                        Err(e) => {
                            warn!(error = format!("{e:#}"), "Full scan failed");
                            full_scan.rearm();
                        }
                    }
                } else {
                    if let Err(e) = self.full_scan_pass().await {
                        warn!(error = format!("{e:#}"), "Full scan failed");
                    }
                    full_scan.rearm();
                }
            }

            if at_risk.is_due(Instant::now()) {
                if let Err(e) = self.at_risk_pass().await {
                    warn!(error = format!("{e:#}"), "At-risk pass failed");
                }
                at_risk.rearm();
            }

            let wake = if scan_in_flight.is_some() {
                at_risk.next_due()
            } else {
                full_scan.next_due().min(at_risk.next_due())
            };

            let finished = match scan_in_flight.as_mut() {
                Some(task) => tokio::select! {
                    joined = &mut task.0 => Some(joined),
                    _ = sleep_until(wake) => None,
                },
                None => {
                    sleep_until(wake).await;
                    None
                }
            };

            if let Some(joined) = finished {
                scan_in_flight = None;
                match joined {
                    Ok(Ok(report)) => {
                        self.apply_scan(&report);
                    }
                    Ok(Err(e)) => warn!(error = format!("{e:#}"), "Full scan failed"),
                    Err(e) => warn!(error = %e, "Full scan task died"),
                }
                full_scan.rearm();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_due_then_rearmed() {
        let mut cadence = Cadence::new(Duration::from_secs(60));
        assert!(cadence.is_due(Instant::now()));

        cadence.rearm();
        assert!(!cadence.is_due(Instant::now()));
        assert!(cadence.is_due(Instant::now() + Duration::from_secs(61)));
    }

    #[test]
    fn test_slow_pass_delays_next_run() {
        let mut cadence = Cadence::new(Duration::from_millis(100));
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        cadence.rearm();
        // Measured from completion, not from the previous due time
        assert!(cadence.next_due() >= before + Duration::from_millis(120));
    }
}
