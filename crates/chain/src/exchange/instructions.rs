//! Instruction builders for the exchange program.

use solana_sdk::hash::hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;

use super::accounts::AssetsList;
use super::Exchange;

/// Anchor instruction discriminator: first 8 bytes of `sha256("global:<name>")`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("global:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.to_bytes()[..8]);
    out
}

pub const CHECK_ACCOUNT: &str = "check_account_collateralization";
pub const SET_ASSETS_PRICES: &str = "set_assets_prices";
pub const LIQUIDATE: &str = "liquidate";

/// Accounts touched by a liquidation.
#[derive(Debug, Clone)]
pub struct LiquidateAccounts {
    pub assets_list: Pubkey,
    /// Stable asset mint
    pub usd_token: Pubkey,
    pub liquidator_usd_account: Pubkey,
    pub liquidator_collateral_account: Pubkey,
    pub exchange_account: Pubkey,
    pub signer: Pubkey,
    pub liquidation_fund: Pubkey,
    pub reserve_account: Pubkey,
}

impl Exchange {
    /// Re-evaluates an account on-chain and assigns a liquidation deadline
    /// if it is undercollateralized.
    pub fn check_account_instruction(
        &self,
        assets_list: &Pubkey,
        exchange_account: &Pubkey,
    ) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new_readonly(self.state, false),
                AccountMeta::new(*exchange_account, false),
                AccountMeta::new_readonly(*assets_list, false),
            ],
            data: instruction_discriminator(CHECK_ACCOUNT).to_vec(),
        }
    }

    /// Pulls current oracle prices into the assets list. Feeds are passed as
    /// remaining accounts in asset order, skipping the stable asset.
    pub fn update_prices_instruction(
        &self,
        assets_list_address: &Pubkey,
        assets_list: &AssetsList,
    ) -> Instruction {
        let mut accounts = vec![AccountMeta::new(*assets_list_address, false)];
        accounts.extend(
            assets_list
                .assets
                .iter()
                .skip(1)
                .map(|asset| AccountMeta::new_readonly(asset.feed_address, false)),
        );

        Instruction {
            program_id: self.program_id,
            accounts,
            data: instruction_discriminator(SET_ASSETS_PRICES).to_vec(),
        }
    }

    /// Repays up to `amount` of the account's debt in exchange for
    /// collateral. `u64::MAX` lets the program clamp to what it can transfer.
    pub fn liquidate_instruction(&self, accounts: &LiquidateAccounts, amount: u64) -> Instruction {
        let mut data = instruction_discriminator(LIQUIDATE).to_vec();
        data.extend_from_slice(&amount.to_le_bytes());

        Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new_readonly(self.state, false),
                AccountMeta::new_readonly(self.exchange_authority, false),
                AccountMeta::new_readonly(accounts.assets_list, false),
                AccountMeta::new_readonly(spl_token::id(), false),
                AccountMeta::new(accounts.usd_token, false),
                AccountMeta::new(accounts.liquidator_usd_account, false),
                AccountMeta::new(accounts.liquidator_collateral_account, false),
                AccountMeta::new(accounts.exchange_account, false),
                AccountMeta::new_readonly(accounts.signer, true),
                AccountMeta::new(accounts.liquidation_fund, false),
                AccountMeta::new(accounts.reserve_account, false),
            ],
            data,
        }
    }
}

/// Name of the exchange instruction encoded in `data`, if recognised.
pub fn decode_instruction_name(data: &[u8]) -> Option<&'static str> {
    let tag = data.get(..8)?;
    [CHECK_ACCOUNT, SET_ASSETS_PRICES, LIQUIDATE]
        .into_iter()
        .find(|name| instruction_discriminator(name) == tag)
}
