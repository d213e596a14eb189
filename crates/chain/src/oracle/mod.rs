//! Oracle prices.
//!
//! - [`pyth`]: price account parsing
//! - [`cache`]: per-asset price cache kept current by feed subscriptions

pub mod cache;
pub mod pyth;

pub use cache::{OraclePrice, PriceCache, STABLE_PRICE};
pub use pyth::{encode_price_account, parse_price_account, OracleError, PythPrice};
