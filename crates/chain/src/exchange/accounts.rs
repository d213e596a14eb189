//! Typed views of the exchange's Anchor accounts.
//!
//! Every account is laid out as an 8-byte discriminator followed by the
//! borsh encoding of its fields.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::hash::hash;
use solana_sdk::pubkey::Pubkey;

use crate::synchronizer::{AccountSchema, DecodeError};

/// Serialized size of a margin account, discriminator included.
/// Used as the structural filter for program-account queries.
pub const MARGIN_ACCOUNT_SIZE: u64 = 1420;

/// Number of collateral slots in a margin account.
pub const MAX_COLLATERAL_ENTRIES: usize = 32;

/// Deadline value of an account that has not been flagged yet.
pub const DEADLINE_UNSET: u64 = u64::MAX;

/// Fixed-point number: `val / 10^scale`.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decimal {
    pub val: u128,
    pub scale: u8,
}

impl Decimal {
    pub const fn new(val: u128, scale: u8) -> Self {
        Self { val, scale }
    }
}

/// Exchange-wide parameters.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct ExchangeState {
    pub admin: Pubkey,
    pub halted: bool,
    pub nonce: u8,
    /// Total debt shares outstanding
    pub debt_shares: u64,
    pub assets_list: Pubkey,
    pub health_factor: Decimal,
    pub max_delay: u32,
    pub fee: Decimal,
    pub swap_tax_ratio: Decimal,
    pub swap_tax_reserve: Decimal,
    /// Fraction of a user's debt that one liquidation may repay
    pub liquidation_rate: Decimal,
    pub penalty_to_liquidator: Decimal,
    pub penalty_to_exchange: Decimal,
    /// Slots between flagging an account and it becoming liquidatable
    pub liquidation_buffer: u32,
    pub debt_interest_rate: Decimal,
    pub accumulated_debt_interest: Decimal,
    pub last_debt_adjustment: i64,
    pub account_version: u8,
    pub bump: u8,
}

/// Price-tracked asset.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct Asset {
    pub feed_address: Pubkey,
    pub price: Decimal,
    pub last_update: u64,
    pub twap: Decimal,
    pub twac: Decimal,
    pub status: u8,
    pub confidence: Decimal,
}

/// Asset accepted as collateral.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct Collateral {
    pub asset_index: u8,
    pub collateral_address: Pubkey,
    pub reserve_address: Pubkey,
    pub liquidation_fund: Pubkey,
    /// Scale of this field is the token's decimal count
    pub reserve_balance: Decimal,
    pub collateral_ratio: Decimal,
    pub max_collateral: Decimal,
}

/// Synthetic asset minted against debt.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct Synthetic {
    pub asset_index: u8,
    pub asset_address: Pubkey,
    pub supply: Decimal,
    pub max_supply: Decimal,
    pub borrowed_supply: Decimal,
    pub swapline_supply: Decimal,
    pub settlement_slot: u64,
}

/// Per-asset parameters and prices. Index 0 of `assets` and `synthetics`
/// is the stable asset.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct AssetsList {
    pub assets: Vec<Asset>,
    pub collaterals: Vec<Collateral>,
    pub synthetics: Vec<Synthetic>,
}

impl AssetsList {
    /// Mint of the stable asset the liquidator repays debt with.
    pub fn stable_mint(&self) -> Option<Pubkey> {
        self.synthetics.first().map(|s| s.asset_address)
    }
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollateralEntry {
    pub amount: u64,
    pub collateral_address: Pubkey,
    /// Index into `AssetsList::collaterals`
    pub index: u8,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStaking {
    pub amount_to_claim: Decimal,
    pub finished_round_points: u64,
    pub current_round_points: u64,
    pub next_round_points: u64,
    pub last_update: u64,
}

/// One user's position.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MarginAccount {
    pub owner: Pubkey,
    pub version: u8,
    pub debt_shares: u64,
    pub liquidation_deadline: u64,
    pub user_staking_data: UserStaking,
    pub bump: u8,
    /// Number of occupied collateral slots
    pub head: u8,
    pub collaterals: [CollateralEntry; MAX_COLLATERAL_ENTRIES],
}

impl MarginAccount {
    /// Occupied collateral slots.
    pub fn collateral_entries(&self) -> &[CollateralEntry] {
        let head = (self.head as usize).min(MAX_COLLATERAL_ENTRIES);
        &self.collaterals[..head]
    }

    /// Deadline slot, or `None` if the account has not been flagged.
    pub fn deadline(&self) -> Option<u64> {
        (self.liquidation_deadline != DEADLINE_UNSET).then_some(self.liquidation_deadline)
    }
}

/// Anchor account discriminator: first 8 bytes of `sha256("account:<Name>")`.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("account:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.to_bytes()[..8]);
    out
}

macro_rules! anchor_account {
    ($ty:ty, $name:literal) => {
        impl AccountSchema for $ty {
            const NAME: &'static str = $name;

            fn decode(data: &[u8]) -> Result<Self, DecodeError> {
                if data.len() < 8 {
                    return Err(DecodeError::Truncated {
                        schema: $name,
                        len: data.len(),
                    });
                }
                if data[..8] != account_discriminator($name) {
                    return Err(DecodeError::Discriminator { schema: $name });
                }
                let mut body = &data[8..];
                <$ty as BorshDeserialize>::deserialize(&mut body).map_err(|e| {
                    DecodeError::Corrupt {
                        schema: $name,
                        reason: e.to_string(),
                    }
                })
            }
        }

        impl $ty {
            /// Serialize with the account discriminator prepended.
            pub fn encode(&self) -> Vec<u8> {
                let mut data = account_discriminator($name).to_vec();
                // Writing into a Vec cannot fail
                let _ = borsh::to_writer(&mut data, self);
                data
            }
        }
    };
}

anchor_account!(ExchangeState, "State");
anchor_account!(AssetsList, "AssetsList");
anchor_account!(MarginAccount, "ExchangeAccount");
