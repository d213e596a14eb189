//! Liquidation executor.
//!
//! Re-verifies a due account against the freshest state, sizes the repayment
//! and submits price refresh, token approval and liquidation as one atomic
//! transaction.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use solana_sdk::clock::Slot;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tracing::{debug, info, instrument, warn};

use liquidator_chain::exchange::math::max_liquidatable;
use liquidator_chain::token::approve_instruction;
use liquidator_chain::{
    fetch_account, ChainClient, Exchange, LiquidateAccounts, MarginAccount, MathError,
    TransactionSender,
};

use crate::risk::RiskSnapshot;
use crate::wallet::LiquidatorWallet;

/// Why an attempt did not submit a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Debt no longer exceeds what the collateral supports
    NotLiquidatable,
    /// No posted collateral to seize
    NoCollateral,
    /// Stable balance is zero
    EmptyWallet,
    /// Discounted amount rounds to zero
    NothingToRepay,
    DeadlineUnset,
    DeadlineNotReached { deadline: Slot },
    /// Another attempt on the same account is running
    InFlight,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLiquidatable => write!(f, "not liquidatable"),
            Self::NoCollateral => write!(f, "no collateral"),
            Self::EmptyWallet => write!(f, "empty wallet"),
            Self::NothingToRepay => write!(f, "nothing to repay"),
            Self::DeadlineUnset => write!(f, "deadline unset"),
            Self::DeadlineNotReached { deadline } => write!(f, "deadline {deadline} not reached"),
            Self::InFlight => write!(f, "attempt in flight"),
            Self::DryRun => write!(f, "dry run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationOutcome {
    Submitted { signature: Signature, amount: u64 },
    Skipped(SkipReason),
    Failed(String),
}

/// Amounts for one liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidationPlan {
    /// Index into the assets list's collaterals
    pub collateral_index: u8,
    /// `debt * liquidation_rate`
    pub max_liquidatable: u128,
    /// `max_liquidatable` after the safety discount
    pub amount_needed: u64,
    /// Spend approved for the exchange authority
    pub approve_amount: u64,
    /// Amount passed to the liquidate instruction
    pub instruction_amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Ready(LiquidationPlan),
    Skip(SkipReason),
}

/// Decide whether and how much to liquidate.
///
/// `amount_permille` is the share of the maximum liquidatable amount
/// requested. When `balance` cannot cover it, the whole balance is approved
/// and `u64::MAX` is passed so the program clamps to what is transferable.
pub fn plan_liquidation(
    account: &MarginAccount,
    snapshot: &RiskSnapshot,
    slot: Slot,
    balance: u64,
    amount_permille: u64,
) -> Result<Plan, MathError> {
    if !snapshot.is_liquidatable(account)? {
        return Ok(Plan::Skip(SkipReason::NotLiquidatable));
    }
    match account.deadline() {
        None => return Ok(Plan::Skip(SkipReason::DeadlineUnset)),
        Some(deadline) if deadline > slot => {
            return Ok(Plan::Skip(SkipReason::DeadlineNotReached { deadline }))
        }
        Some(_) => {}
    }
    let Some(entry) = account.collateral_entries().first() else {
        return Ok(Plan::Skip(SkipReason::NoCollateral));
    };

    let debt = snapshot.user_debt(account)?;
    let max = max_liquidatable(debt, snapshot.state.liquidation_rate)?;
    let needed = max
        .checked_mul(u128::from(amount_permille))
        .ok_or(MathError::Overflow)?
        / 1000;
    let needed = u64::try_from(needed).map_err(|_| MathError::Overflow)?;

    if needed == 0 {
        return Ok(Plan::Skip(SkipReason::NothingToRepay));
    }

    let (approve_amount, instruction_amount) = if balance >= needed {
        (needed, needed)
    } else if balance == 0 {
        return Ok(Plan::Skip(SkipReason::EmptyWallet));
    } else {
        (balance, u64::MAX)
    };

    Ok(Plan::Ready(LiquidationPlan {
        collateral_index: entry.index,
        max_liquidatable: max,
        amount_needed: needed,
        approve_amount,
        instruction_amount,
    }))
}

pub struct Liquidator {
    chain: Arc<dyn ChainClient>,
    sender: Arc<TransactionSender>,
    exchange: Exchange,
    wallet: Arc<LiquidatorWallet>,
    amount_permille: u64,
    dry_run: bool,
}

impl Liquidator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        sender: Arc<TransactionSender>,
        exchange: Exchange,
        wallet: Arc<LiquidatorWallet>,
        amount_permille: u64,
        dry_run: bool,
    ) -> Self {
        Self {
            chain,
            sender,
            exchange,
            wallet,
            amount_permille,
            dry_run,
        }
    }

    pub fn wallet(&self) -> &LiquidatorWallet {
        &self.wallet
    }

    /// Attempt to liquidate `address`. Never returns an error: every failure
    /// is reported as [`LiquidationOutcome::Failed`].
    #[instrument(skip_all, fields(address = %address, slot))]
    pub async fn attempt(
        &self,
        address: Pubkey,
        snapshot: &RiskSnapshot,
        slot: Slot,
        balance: u64,
    ) -> LiquidationOutcome {
        match self.try_attempt(address, snapshot, slot, balance).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let cause = format!("{e:#}");
                warn!(address = %address, error = %cause, "Liquidation failed");
                LiquidationOutcome::Failed(cause)
            }
        }
    }

    async fn try_attempt(
        &self,
        address: Pubkey,
        snapshot: &RiskSnapshot,
        slot: Slot,
        balance: u64,
    ) -> anyhow::Result<LiquidationOutcome> {
        let start = Instant::now();

        // The scan copy may be minutes old
        let account: MarginAccount = fetch_account(self.chain.as_ref(), &address).await?;

        let plan = match plan_liquidation(&account, snapshot, slot, balance, self.amount_permille)? {
            Plan::Ready(plan) => plan,
            Plan::Skip(reason) => {
                debug!(address = %address, reason = %reason, "Skipping liquidation");
                return Ok(LiquidationOutcome::Skipped(reason));
            }
        };

        let collateral = snapshot
            .assets_list
            .collaterals
            .get(plan.collateral_index as usize)
            .ok_or(MathError::UnknownCollateral(plan.collateral_index))?;
        let liquidator_collateral_account = self
            .wallet
            .collateral_account(plan.collateral_index)
            .ok_or_else(|| {
                anyhow::anyhow!("no token account for collateral {}", plan.collateral_index)
            })?;

        let owner = self.wallet.owner();
        let accounts = LiquidateAccounts {
            assets_list: snapshot.assets_list_address,
            usd_token: self.wallet.stable_mint(),
            liquidator_usd_account: self.wallet.stable_account(),
            liquidator_collateral_account,
            exchange_account: address,
            signer: owner,
            liquidation_fund: collateral.liquidation_fund,
            reserve_account: collateral.reserve_address,
        };

        let instructions = vec![
            self.exchange
                .update_prices_instruction(&snapshot.assets_list_address, &snapshot.assets_list),
            approve_instruction(
                &self.wallet.stable_account(),
                &self.exchange.exchange_authority,
                &owner,
                plan.approve_amount,
            )?,
            self.exchange
                .liquidate_instruction(&accounts, plan.instruction_amount),
        ];

        info!(
            address = %address,
            collateral = plan.collateral_index,
            max_liquidatable = plan.max_liquidatable,
            needed = plan.amount_needed,
            approve = plan.approve_amount,
            balance,
            "Liquidating"
        );

        if self.dry_run {
            info!(
                address = %address,
                instructions = instructions.len(),
                "Dry run: liquidation not submitted"
            );
            return Ok(LiquidationOutcome::Skipped(SkipReason::DryRun));
        }

        let signature = self.sender.send(&instructions).await?;
        info!(
            address = %address,
            signature = %signature,
            amount = plan.approve_amount,
            total_ms = start.elapsed().as_millis(),
            "Liquidation submitted"
        );

        Ok(LiquidationOutcome::Submitted {
            signature,
            amount: plan.approve_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests::{account, assets_list};
    use liquidator_chain::exchange::instructions::{decode_instruction_name, LIQUIDATE};
    use liquidator_chain::mock::MockChain;
    use liquidator_chain::token::associated_token_address;
    use liquidator_chain::{Decimal, ExchangeState, TokenAccount};
    use solana_sdk::signature::Keypair;

    /// 500 debt against 400 max debt at a 20% liquidation rate.
    fn snapshot() -> RiskSnapshot {
        let state = ExchangeState {
            debt_shares: 1_000,
            liquidation_rate: Decimal::new(20, 2),
            ..Default::default()
        };
        RiskSnapshot::new(Arc::new(state), assets_list(500_000_000), Pubkey::new_unique()).unwrap()
    }

    fn due(deadline: u64) -> MarginAccount {
        let mut margin = account(1_000, 400_000_000);
        margin.liquidation_deadline = deadline;
        margin
    }

    fn ready(plan: Plan) -> LiquidationPlan {
        match plan {
            Plan::Ready(plan) => plan,
            Plan::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn test_amount_is_discounted_maximum() {
        let plan = ready(plan_liquidation(&due(10), &snapshot(), 10, u64::MAX, 999).unwrap());
        assert_eq!(plan.max_liquidatable, 100_000_000);
        assert_eq!(plan.amount_needed, 99_900_000);
        assert_eq!(plan.approve_amount, 99_900_000);
        assert_eq!(plan.instruction_amount, 99_900_000);
        assert_eq!(plan.collateral_index, 0);
    }

    #[test]
    fn test_amount_never_exceeds_bounds() {
        let snapshot = snapshot();
        for balance in [1, 5_000, 99_899_999, 99_900_000, 200_000_000] {
            let plan = ready(plan_liquidation(&due(1), &snapshot, 1, balance, 999).unwrap());
            assert!(plan.approve_amount <= plan.amount_needed);
            assert!(plan.approve_amount <= balance);
            assert!(u128::from(plan.amount_needed) * 1000 <= plan.max_liquidatable * 999);
        }
    }

    #[test]
    fn test_short_balance_uses_sentinel() {
        let plan = ready(plan_liquidation(&due(1), &snapshot(), 1, 1_000, 999).unwrap());
        assert_eq!(plan.approve_amount, 1_000);
        assert_eq!(plan.instruction_amount, u64::MAX);
    }

    #[test]
    fn test_skip_reasons() {
        let snapshot = snapshot();
        let plan = |margin: &MarginAccount, slot, balance| {
            plan_liquidation(margin, &snapshot, slot, balance, 999).unwrap()
        };

        assert_eq!(plan(&due(1), 1, 0), Plan::Skip(SkipReason::EmptyWallet));
        assert_eq!(
            plan(&due(50), 49, 1_000),
            Plan::Skip(SkipReason::DeadlineNotReached { deadline: 50 })
        );
        assert_eq!(
            plan(&due(liquidator_chain::DEADLINE_UNSET), 49, 1_000),
            Plan::Skip(SkipReason::DeadlineUnset)
        );

        let mut healthy = due(1);
        healthy.collaterals[0].amount = 10_000_000_000;
        assert_eq!(plan(&healthy, 1, 1_000), Plan::Skip(SkipReason::NotLiquidatable));

        let mut bare = due(1);
        bare.head = 0;
        assert_eq!(plan(&bare, 1, 1_000), Plan::Skip(SkipReason::NoCollateral));
    }

    #[test]
    fn test_tiny_debt_has_nothing_to_repay() {
        let state = ExchangeState {
            debt_shares: 1_000,
            liquidation_rate: Decimal::new(20, 2),
            ..Default::default()
        };
        let snapshot =
            RiskSnapshot::new(Arc::new(state), assets_list(4), Pubkey::new_unique()).unwrap();
        let mut margin = account(1_000, 0);
        margin.liquidation_deadline = 1;
        assert_eq!(
            plan_liquidation(&margin, &snapshot, 1, 1_000, 999).unwrap(),
            Plan::Skip(SkipReason::NothingToRepay)
        );
    }

    struct Fixture {
        chain: Arc<MockChain>,
        snapshot: RiskSnapshot,
        liquidator: Liquidator,
    }

    async fn fixture(dry_run: bool) -> Fixture {
        let chain = Arc::new(MockChain::new());
        let sender = Arc::new(TransactionSender::new(chain.clone(), Keypair::new()));
        let owner = sender.pubkey();
        let mut snapshot = snapshot();
        snapshot.assets_list.collaterals[0].collateral_address = Pubkey::new_unique();
        snapshot.assets_list.synthetics[0].asset_address = Pubkey::new_unique();

        for mint in [
            snapshot.assets_list.collaterals[0].collateral_address,
            snapshot.assets_list.synthetics[0].asset_address,
        ] {
            let token = TokenAccount {
                mint,
                owner,
                amount: 0,
            };
            chain.insert_account(
                associated_token_address(&owner, &mint),
                Pubkey::default(),
                token.encode(),
            );
        }

        let wallet = LiquidatorWallet::provision(chain.clone(), &sender, &snapshot.assets_list, false)
            .await
            .unwrap();
        let exchange = Exchange::new(Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        let liquidator = Liquidator::new(
            chain.clone(),
            sender,
            exchange,
            Arc::new(wallet),
            999,
            dry_run,
        );
        Fixture {
            chain,
            snapshot,
            liquidator,
        }
    }

    impl Fixture {
        fn add(&self, margin: &MarginAccount) -> Pubkey {
            let address = Pubkey::new_unique();
            self.chain
                .insert_account(address, self.liquidator.exchange.program_id, margin.encode());
            address
        }
    }

    #[tokio::test]
    async fn test_attempt_submits_batched_transaction() {
        let fx = fixture(false).await;
        let address = fx.add(&due(10));

        let outcome = fx.liquidator.attempt(address, &fx.snapshot, 10, u64::MAX).await;

        assert!(matches!(
            outcome,
            LiquidationOutcome::Submitted { amount: 99_900_000, .. }
        ));
        let sent = fx.chain.sent_transactions();
        assert_eq!(sent.len(), 1);
        let instructions = &sent[0].message.instructions;
        assert_eq!(instructions.len(), 3);
        assert_eq!(decode_instruction_name(&instructions[2].data), Some(LIQUIDATE));
        assert_eq!(instructions[2].data[8..], 99_900_000u64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_zero_balance_sends_nothing() {
        let fx = fixture(false).await;
        let address = fx.add(&due(10));

        let outcome = fx.liquidator.attempt(address, &fx.snapshot, 10, 0).await;

        assert_eq!(outcome, LiquidationOutcome::Skipped(SkipReason::EmptyWallet));
        assert!(fx.chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_rechecks_fresh_account() {
        let fx = fixture(false).await;
        let address = fx.add(&due(10));
        // Position repaired since the scan
        let mut repaired = due(10);
        repaired.collaterals[0].amount = 10_000_000_000;
        fx.chain
            .insert_account(address, fx.liquidator.exchange.program_id, repaired.encode());

        let outcome = fx.liquidator.attempt(address, &fx.snapshot, 10, u64::MAX).await;
        assert_eq!(outcome, LiquidationOutcome::Skipped(SkipReason::NotLiquidatable));
    }

    #[tokio::test]
    async fn test_submission_error_is_reported() {
        let fx = fixture(false).await;
        fx.chain.fail_sends(true);
        let address = fx.add(&due(10));

        let outcome = fx.liquidator.attempt(address, &fx.snapshot, 10, u64::MAX).await;
        assert!(matches!(outcome, LiquidationOutcome::Failed(_)));

        let missing = fx.liquidator.attempt(Pubkey::new_unique(), &fx.snapshot, 10, 1).await;
        assert!(matches!(missing, LiquidationOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_dry_run_builds_without_sending() {
        let fx = fixture(true).await;
        let address = fx.add(&due(10));

        let outcome = fx.liquidator.attempt(address, &fx.snapshot, 10, u64::MAX).await;
        assert_eq!(outcome, LiquidationOutcome::Skipped(SkipReason::DryRun));
        assert!(fx.chain.sent_transactions().is_empty());
    }
}
