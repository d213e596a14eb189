//! Liquidator wallet: token accounts and stable balance.

use std::sync::Arc;

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use liquidator_chain::token::{associated_token_address, create_associated_account_idempotent};
use liquidator_chain::{
    AccountSchema, AccountSynchronizer, AssetsList, ChainClient, Seed, TokenAccount,
    TransactionSender,
};

/// Account creations batched into one transaction.
const CREATE_BATCH: usize = 6;

pub struct LiquidatorWallet {
    owner: Pubkey,
    /// Associated token account per collateral index
    collateral_accounts: Vec<Pubkey>,
    stable_mint: Pubkey,
    stable: AccountSynchronizer<TokenAccount>,
}

impl LiquidatorWallet {
    /// Ensure the wallet holds a token account for every collateral and for
    /// the stable asset, creating missing ones unless `dry_run` is set.
    pub async fn provision(
        chain: Arc<dyn ChainClient>,
        sender: &TransactionSender,
        assets_list: &AssetsList,
        dry_run: bool,
    ) -> Result<Self> {
        let owner = sender.pubkey();
        let stable_mint = assets_list
            .stable_mint()
            .context("assets list has no stable synthetic")?;

        let collateral_accounts: Vec<Pubkey> = assets_list
            .collaterals
            .iter()
            .map(|c| associated_token_address(&owner, &c.collateral_address))
            .collect();
        let stable_account = associated_token_address(&owner, &stable_mint);

        let mints = assets_list
            .collaterals
            .iter()
            .map(|c| c.collateral_address)
            .chain(std::iter::once(stable_mint));

        let mut missing = Vec::new();
        let mut stable_existing = None;
        for mint in mints {
            let address = associated_token_address(&owner, &mint);
            match chain.get_account_opt(&address).await? {
                Some(account) if address == stable_account => {
                    stable_existing = Some(TokenAccount::decode(&account.data)?);
                }
                Some(_) => {}
                None => missing.push(mint),
            }
        }

        if !missing.is_empty() {
            if dry_run {
                warn!(missing = missing.len(), "Dry run: not creating token accounts");
            } else {
                info!(missing = missing.len(), "Creating token accounts");
                for batch in missing.chunks(CREATE_BATCH) {
                    let instructions: Vec<_> = batch
                        .iter()
                        .map(|mint| create_associated_account_idempotent(&owner, &owner, mint))
                        .collect();
                    sender
                        .send(&instructions)
                        .await
                        .context("creating token accounts")?;
                }
            }
        }

        // Reuse the account read above instead of fetching it again
        let seed = match stable_existing {
            Some(account) => Seed::Known(account),
            None if dry_run => Seed::Known(TokenAccount {
                mint: stable_mint,
                owner,
                amount: 0,
            }),
            None => Seed::Fetch,
        };
        let stable = AccountSynchronizer::new(chain, stable_account, seed).await?;

        info!(
            collaterals = collateral_accounts.len(),
            stable_account = %stable_account,
            stable_balance = stable.get().amount,
            "Liquidator wallet ready"
        );

        Ok(Self {
            owner,
            collateral_accounts,
            stable_mint,
            stable,
        })
    }

    pub fn owner(&self) -> Pubkey {
        self.owner
    }

    pub fn stable_mint(&self) -> Pubkey {
        self.stable_mint
    }

    pub fn stable_account(&self) -> Pubkey {
        self.stable.address()
    }

    /// Token account receiving collateral of `index`.
    pub fn collateral_account(&self, index: u8) -> Option<Pubkey> {
        self.collateral_accounts.get(index as usize).copied()
    }

    /// Last synchronized stable balance.
    pub fn stable_balance(&self) -> u64 {
        self.stable.get().amount
    }

    /// Re-read the stable balance after spending from it.
    pub async fn refresh_balance(&self) -> Result<u64> {
        Ok(self.stable.refresh().await?.amount)
    }

    pub fn warn_if_low(&self, minimum: u64) -> bool {
        let balance = self.stable_balance();
        let low = balance < minimum;
        if low {
            warn!(balance, minimum, "Stable balance is low");
        }
        low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquidator_chain::exchange::{Collateral, Synthetic};
    use liquidator_chain::mock::MockChain;
    use solana_sdk::signature::Keypair;

    fn assets_list(collaterals: usize) -> AssetsList {
        AssetsList {
            collaterals: (0..collaterals)
                .map(|_| Collateral {
                    collateral_address: Pubkey::new_unique(),
                    ..Default::default()
                })
                .collect(),
            synthetics: vec![Synthetic {
                asset_address: Pubkey::new_unique(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn token(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        TokenAccount {
            mint,
            owner,
            amount,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_existing_accounts_not_recreated() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain.clone(), Keypair::new());
        let owner = sender.pubkey();
        let list = assets_list(2);
        let stable_mint = list.stable_mint().unwrap();

        for c in &list.collaterals {
            let ata = associated_token_address(&owner, &c.collateral_address);
            chain.insert_account(ata, Pubkey::default(), token(c.collateral_address, owner, 0));
        }
        let stable_ata = associated_token_address(&owner, &stable_mint);
        chain.insert_account(stable_ata, Pubkey::default(), token(stable_mint, owner, 2_500_000));

        let wallet = LiquidatorWallet::provision(chain.clone(), &sender, &list, false)
            .await
            .unwrap();

        assert!(chain.sent_transactions().is_empty());
        assert_eq!(wallet.stable_balance(), 2_500_000);
        // One existence check per mint, no second fetch for the stable account
        assert_eq!(chain.fetch_count(), 3);
        assert_eq!(
            wallet.collateral_account(1),
            Some(associated_token_address(&owner, &list.collaterals[1].collateral_address))
        );
        assert_eq!(wallet.collateral_account(2), None);
        assert!(!wallet.warn_if_low(1_000_000));
        assert!(wallet.warn_if_low(3_000_000));
    }

    #[tokio::test]
    async fn test_missing_accounts_are_created() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain.clone(), Keypair::new());
        let owner = sender.pubkey();
        let list = assets_list(1);
        let stable_mint = list.stable_mint().unwrap();
        let stable_ata = associated_token_address(&owner, &stable_mint);

        // Creating the accounts makes them exist with a zero balance
        chain.on_send(move |chain, tx| {
            for ix in &tx.message.instructions {
                let wallet = tx.message.account_keys[ix.accounts[2] as usize];
                let ata = tx.message.account_keys[ix.accounts[1] as usize];
                let mint = tx.message.account_keys[ix.accounts[3] as usize];
                chain.insert_account(ata, Pubkey::default(), token(mint, wallet, 0));
            }
            Ok(())
        });

        let wallet = LiquidatorWallet::provision(chain.clone(), &sender, &list, false)
            .await
            .unwrap();

        let sent = chain.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.instructions.len(), 2);
        assert_eq!(wallet.stable_account(), stable_ata);
        assert_eq!(wallet.stable_balance(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_create_accounts() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain.clone(), Keypair::new());
        let list = assets_list(1);

        let wallet = LiquidatorWallet::provision(chain.clone(), &sender, &list, true)
            .await
            .unwrap();

        assert!(chain.sent_transactions().is_empty());
        assert_eq!(wallet.stable_balance(), 0);
    }

    #[tokio::test]
    async fn test_refresh_balance() {
        let chain = Arc::new(MockChain::new());
        let sender = TransactionSender::new(chain.clone(), Keypair::new());
        let owner = sender.pubkey();
        let list = assets_list(0);
        let stable_mint = list.stable_mint().unwrap();
        let stable_ata = associated_token_address(&owner, &stable_mint);
        chain.insert_account(stable_ata, Pubkey::default(), token(stable_mint, owner, 10));

        let wallet = LiquidatorWallet::provision(chain.clone(), &sender, &list, false)
            .await
            .unwrap();
        chain.insert_account(stable_ata, Pubkey::default(), token(stable_mint, owner, 4));

        assert_eq!(wallet.stable_balance(), 10);
        assert_eq!(wallet.refresh_balance().await.unwrap(), 4);
        assert_eq!(wallet.stable_balance(), 4);
    }
}
