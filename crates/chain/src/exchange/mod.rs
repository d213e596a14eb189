//! Exchange program bindings.
//!
//! - [`accounts`]: Anchor account layouts (state, assets list, margin accounts)
//! - [`math`]: debt and collateral formulas
//! - [`instructions`]: instruction builders

pub mod accounts;
pub mod instructions;
pub mod math;

pub use accounts::{
    account_discriminator, Asset, AssetsList, Collateral, CollateralEntry, Decimal,
    ExchangeState, MarginAccount, Synthetic, UserStaking, DEADLINE_UNSET, MARGIN_ACCOUNT_SIZE,
    MAX_COLLATERAL_ENTRIES,
};
pub use instructions::{decode_instruction_name, instruction_discriminator, LiquidateAccounts};
pub use math::{MathError, ACCURACY, ORACLE_OFFSET};

use solana_sdk::pubkey::Pubkey;

/// Addresses identifying one deployment of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// Exchange program id
    pub program_id: Pubkey,
    /// Exchange state account
    pub state: Pubkey,
    /// PDA authorised to move tokens on behalf of the exchange
    pub exchange_authority: Pubkey,
}

impl Exchange {
    pub fn new(program_id: Pubkey, state: Pubkey, exchange_authority: Pubkey) -> Self {
        Self {
            program_id,
            state,
            exchange_authority,
        }
    }
}
