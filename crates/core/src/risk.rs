//! Point-in-time view of exchange state for risk decisions.
//!
//! Every classification and every liquidation amount is computed against one
//! [`RiskSnapshot`]: the exchange state, the assets list with cached oracle
//! prices overlaid, and the total debt derived from them, captured together.

use std::sync::Arc;

use liquidator_chain::exchange::math::{
    calculate_debt, calculate_user_debt, calculate_user_max_debt,
};
use liquidator_chain::{
    AccountSynchronizer, AssetsList, ExchangeState, MarginAccount, MathError, PriceCache,
};
use solana_sdk::pubkey::Pubkey;

/// Debt position of one account under a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub user_debt: u128,
    pub user_max_debt: u128,
    pub at_risk: bool,
}

#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub state: Arc<ExchangeState>,
    pub assets_list: AssetsList,
    pub assets_list_address: Pubkey,
    /// Total system debt under `assets_list` prices
    pub total_debt: u128,
}

impl RiskSnapshot {
    pub fn new(
        state: Arc<ExchangeState>,
        assets_list: AssetsList,
        assets_list_address: Pubkey,
    ) -> Result<Self, MathError> {
        let total_debt = calculate_debt(&assets_list)?;
        Ok(Self {
            state,
            assets_list,
            assets_list_address,
            total_debt,
        })
    }

    /// Capture the current synchronized state with cached prices applied.
    pub fn capture(
        state: &AccountSynchronizer<ExchangeState>,
        assets: &AccountSynchronizer<AssetsList>,
        prices: &PriceCache,
    ) -> Result<Self, MathError> {
        let mut assets_list = (*assets.get()).clone();
        prices.apply_to(&mut assets_list);
        Self::new(state.get(), assets_list, assets.address())
    }

    pub fn user_debt(&self, account: &MarginAccount) -> Result<u128, MathError> {
        calculate_user_debt(account, &self.state, self.total_debt)
    }

    pub fn user_max_debt(&self, account: &MarginAccount) -> Result<u128, MathError> {
        calculate_user_max_debt(account, &self.assets_list)
    }

    pub fn classify(&self, account: &MarginAccount) -> Result<Classification, MathError> {
        if account.debt_shares == 0 {
            return Ok(Classification {
                user_debt: 0,
                user_max_debt: self.user_max_debt(account).unwrap_or(0),
                at_risk: false,
            });
        }
        let user_debt = self.user_debt(account)?;
        let user_max_debt = self.user_max_debt(account)?;
        Ok(Classification {
            user_debt,
            user_max_debt,
            at_risk: user_debt > user_max_debt,
        })
    }

    /// Whether the account's debt exceeds what its collateral supports.
    pub fn is_liquidatable(&self, account: &MarginAccount) -> Result<bool, MathError> {
        Ok(self.classify(account)?.at_risk)
    }
}
