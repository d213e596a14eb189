//! Debt and collateral formulas.
//!
//! All USD values are integers scaled by `10^ACCURACY`.

use thiserror::Error;

use super::accounts::{AssetsList, Decimal, ExchangeState, MarginAccount};

/// Decimal places of USD-denominated values (and of the stable asset).
pub const ACCURACY: u8 = 6;

/// Decimal places of oracle prices.
pub const ORACLE_OFFSET: u8 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MathError {
    #[error("arithmetic overflow")]
    Overflow,
    #[error("collateral index {0} not in assets list")]
    UnknownCollateral(u8),
    #[error("asset index {0} not in assets list")]
    UnknownAsset(u8),
}

/// Move `value` from `from` decimal places to `to` decimal places,
/// rounding down.
pub fn rescale(value: u128, from: u8, to: u8) -> Result<u128, MathError> {
    if to >= from {
        let factor = 10u128
            .checked_pow(u32::from(to - from))
            .ok_or(MathError::Overflow)?;
        value.checked_mul(factor).ok_or(MathError::Overflow)
    } else {
        let divisor = 10u128
            .checked_pow(u32::from(from - to))
            .ok_or(MathError::Overflow)?;
        Ok(value / divisor)
    }
}

/// USD value (ACCURACY decimals) of `amount` tokens with `decimals`
/// decimals at `price`.
pub fn usd_value(amount: u128, decimals: u8, price: Decimal) -> Result<u128, MathError> {
    let raw = amount.checked_mul(price.val).ok_or(MathError::Overflow)?;
    // raw carries decimals + price.scale decimal places
    let places = decimals.checked_add(price.scale).ok_or(MathError::Overflow)?;
    rescale(raw, places, ACCURACY)
}

/// `value * ratio`, rounding down.
pub fn mul_decimal(value: u128, ratio: Decimal) -> Result<u128, MathError> {
    let raw = value.checked_mul(ratio.val).ok_or(MathError::Overflow)?;
    rescale(raw, ratio.scale, 0)
}

fn asset_price(assets_list: &AssetsList, index: u8) -> Result<Decimal, MathError> {
    assets_list
        .assets
        .get(index as usize)
        .map(|a| a.price)
        .ok_or(MathError::UnknownAsset(index))
}

/// Total system debt: the USD value of every synthetic's outstanding supply.
pub fn calculate_debt(assets_list: &AssetsList) -> Result<u128, MathError> {
    let mut total = 0u128;
    for synthetic in &assets_list.synthetics {
        let outstanding = synthetic
            .supply
            .val
            .saturating_sub(synthetic.borrowed_supply.val)
            .saturating_sub(synthetic.swapline_supply.val);
        let price = asset_price(assets_list, synthetic.asset_index)?;
        let value = usd_value(outstanding, synthetic.supply.scale, price)?;
        total = total.checked_add(value).ok_or(MathError::Overflow)?;
    }
    Ok(total)
}

/// Maximum debt the account's posted collateral supports.
pub fn calculate_user_max_debt(
    account: &MarginAccount,
    assets_list: &AssetsList,
) -> Result<u128, MathError> {
    let mut total = 0u128;
    for entry in account.collateral_entries() {
        let collateral = assets_list
            .collaterals
            .get(entry.index as usize)
            .ok_or(MathError::UnknownCollateral(entry.index))?;
        let price = asset_price(assets_list, collateral.asset_index)?;
        let value = usd_value(
            u128::from(entry.amount),
            collateral.reserve_balance.scale,
            price,
        )?;
        let supported = mul_decimal(value, collateral.collateral_ratio)?;
        total = total.checked_add(supported).ok_or(MathError::Overflow)?;
    }
    Ok(total)
}

/// The account's share of `total_debt`.
pub fn calculate_user_debt(
    account: &MarginAccount,
    state: &ExchangeState,
    total_debt: u128,
) -> Result<u128, MathError> {
    if state.debt_shares == 0 {
        return Ok(0);
    }
    let scaled = u128::from(account.debt_shares)
        .checked_mul(total_debt)
        .ok_or(MathError::Overflow)?;
    Ok(scaled / u128::from(state.debt_shares))
}

/// Whether the account's debt exceeds what its collateral supports.
pub fn is_liquidatable(
    account: &MarginAccount,
    state: &ExchangeState,
    assets_list: &AssetsList,
) -> Result<bool, MathError> {
    if account.debt_shares == 0 {
        return Ok(false);
    }
    let total_debt = calculate_debt(assets_list)?;
    let user_debt = calculate_user_debt(account, state, total_debt)?;
    let user_max_debt = calculate_user_max_debt(account, assets_list)?;
    Ok(user_debt > user_max_debt)
}

/// Largest amount of `debt` one liquidation may repay.
pub fn max_liquidatable(debt: u128, liquidation_rate: Decimal) -> Result<u128, MathError> {
    mul_decimal(debt, liquidation_rate)
}
