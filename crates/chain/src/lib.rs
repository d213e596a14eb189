//! Liquidator chain interaction layer.
//!
//! This crate provides:
//! - The [`ChainClient`] ledger interface and its RPC implementation
//! - Typed bindings for the exchange program (accounts, math, instructions)
//! - Account synchronizers kept current by websocket subscriptions
//! - Pyth price parsing and a push-updated price cache
//! - SPL token helpers
//! - Transaction signing and sending
//!
//! With the `test-utils` feature, [`mock::MockChain`] provides an in-memory
//! ledger for tests.

pub mod exchange;
pub mod oracle;
mod provider;
mod signer;
pub mod synchronizer;
pub mod token;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use exchange::{
    AssetsList, Collateral, CollateralEntry, Decimal, Exchange, ExchangeState, LiquidateAccounts,
    MarginAccount, MathError, ACCURACY, DEADLINE_UNSET, MARGIN_ACCOUNT_SIZE, ORACLE_OFFSET,
};
pub use oracle::{OracleError, OraclePrice, PriceCache};
pub use provider::{AccountStream, ChainClient, RpcChainClient};
pub use signer::TransactionSender;
pub use synchronizer::{fetch_account, AccountSchema, AccountSynchronizer, DecodeError, Seed};
pub use token::TokenAccount;
