//! SPL token helpers: token account view, associated token accounts, approvals.

use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{pubkey, system_program};
use spl_token::state::{Account as SplAccount, AccountState};

use crate::synchronizer::{AccountSchema, DecodeError};

/// Associated token account program.
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Balance-relevant fields of an SPL token account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}

impl AccountSchema for TokenAccount {
    const NAME: &'static str = "TokenAccount";

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < SplAccount::LEN {
            return Err(DecodeError::Truncated {
                schema: Self::NAME,
                len: data.len(),
            });
        }
        let account =
            SplAccount::unpack(&data[..SplAccount::LEN]).map_err(|e| DecodeError::Corrupt {
                schema: Self::NAME,
                reason: e.to_string(),
            })?;
        Ok(Self {
            mint: account.mint,
            owner: account.owner,
            amount: account.amount,
        })
    }
}

impl TokenAccount {
    /// Packed, initialized SPL token account data.
    pub fn encode(&self) -> Vec<u8> {
        let account = SplAccount {
            mint: self.mint,
            owner: self.owner,
            amount: self.amount,
            state: AccountState::Initialized,
            ..Default::default()
        };
        let mut data = vec![0u8; SplAccount::LEN];
        SplAccount::pack(account, &mut data).unwrap_or_default();
        data
    }
}

/// Associated token account of `wallet` for `mint`.
pub fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[wallet.as_ref(), spl_token::id().as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// Creates the associated token account unless it already exists.
pub fn create_associated_account_idempotent(
    payer: &Pubkey,
    wallet: &Pubkey,
    mint: &Pubkey,
) -> Instruction {
    let address = associated_token_address(wallet, mint);
    Instruction {
        program_id: ASSOCIATED_TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(address, false),
            AccountMeta::new_readonly(*wallet, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        // 1 = CreateIdempotent
        data: vec![1],
    }
}

/// Lets `delegate` spend up to `amount` from `source`.
pub fn approve_instruction(
    source: &Pubkey,
    delegate: &Pubkey,
    owner: &Pubkey,
    amount: u64,
) -> anyhow::Result<Instruction> {
    Ok(spl_token::instruction::approve(
        &spl_token::id(),
        source,
        delegate,
        owner,
        &[],
        amount,
    )?)
}
