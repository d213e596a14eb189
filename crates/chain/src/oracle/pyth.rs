//! Pyth price account parsing.
//!
//! Only the header and the aggregate price are read, at their fixed offsets
//! in the v2 price account layout.

use thiserror::Error;

use crate::exchange::{Decimal, ORACLE_OFFSET};

pub const PYTH_MAGIC: u32 = 0xa1b2_c3d4;
const PRICE_ACCOUNT_TYPE: u32 = 3;
const STATUS_TRADING: u32 = 1;

const MAGIC_OFF: usize = 0;
const ATYPE_OFF: usize = 8;
const EXPO_OFF: usize = 20;
const AGG_PRICE_OFF: usize = 208;
const AGG_CONF_OFF: usize = 216;
const AGG_STATUS_OFF: usize = 224;
const AGG_PUB_SLOT_OFF: usize = 232;

/// Bytes needed to read every field above.
pub const PRICE_ACCOUNT_MIN_LEN: usize = 240;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("price account too short ({0} bytes)")]
    Truncated(usize),
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("not a price account (type {0})")]
    NotPriceAccount(u32),
    #[error("price not trading (status {0})")]
    NotTrading(u32),
    #[error("non-positive price {0}")]
    NonPositivePrice(i64),
    #[error("price exponent {0} out of range")]
    Exponent(i32),
}

/// Aggregate price of a Pyth feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythPrice {
    pub price: i64,
    pub conf: u64,
    pub expo: i32,
    pub publish_slot: u64,
}

fn read<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[offset..offset + N]);
    buf
}

/// Parse a Pyth price account. Anything other than a trading, positive
/// aggregate price is rejected.
pub fn parse_price_account(data: &[u8]) -> Result<PythPrice, OracleError> {
    if data.len() < PRICE_ACCOUNT_MIN_LEN {
        return Err(OracleError::Truncated(data.len()));
    }

    let magic = u32::from_le_bytes(read(data, MAGIC_OFF));
    if magic != PYTH_MAGIC {
        return Err(OracleError::BadMagic(magic));
    }
    let atype = u32::from_le_bytes(read(data, ATYPE_OFF));
    if atype != PRICE_ACCOUNT_TYPE {
        return Err(OracleError::NotPriceAccount(atype));
    }
    let status = u32::from_le_bytes(read(data, AGG_STATUS_OFF));
    if status != STATUS_TRADING {
        return Err(OracleError::NotTrading(status));
    }

    let price = i64::from_le_bytes(read(data, AGG_PRICE_OFF));
    if price <= 0 {
        return Err(OracleError::NonPositivePrice(price));
    }

    Ok(PythPrice {
        price,
        conf: u64::from_le_bytes(read(data, AGG_CONF_OFF)),
        expo: i32::from_le_bytes(read(data, EXPO_OFF)),
        publish_slot: u64::from_le_bytes(read(data, AGG_PUB_SLOT_OFF)),
    })
}

impl PythPrice {
    fn rescale(&self, value: u128) -> Result<u128, OracleError> {
        let scale = self
            .expo
            .checked_add(i32::from(ORACLE_OFFSET))
            .ok_or(OracleError::Exponent(self.expo))?;
        if scale >= 0 {
            10u128
                .checked_pow(scale as u32)
                .and_then(|mul| value.checked_mul(mul))
                .ok_or(OracleError::Exponent(self.expo))
        } else {
            let div = 10u128
                .checked_pow(scale.unsigned_abs())
                .ok_or(OracleError::Exponent(self.expo))?;
            Ok(value / div)
        }
    }

    /// Price as a decimal with the exchange's oracle precision.
    pub fn to_decimal(&self) -> Result<Decimal, OracleError> {
        let val = self.rescale(self.price as u128)?;
        Ok(Decimal::new(val, ORACLE_OFFSET))
    }

    /// Confidence interval with the exchange's oracle precision.
    pub fn confidence(&self) -> Result<Decimal, OracleError> {
        let val = self.rescale(u128::from(self.conf))?;
        Ok(Decimal::new(val, ORACLE_OFFSET))
    }
}

/// Build price account data. Used by tests and the in-memory ledger.
pub fn encode_price_account(price: i64, expo: i32, conf: u64, publish_slot: u64) -> Vec<u8> {
    let mut data = vec![0u8; PRICE_ACCOUNT_MIN_LEN];
    data[MAGIC_OFF..MAGIC_OFF + 4].copy_from_slice(&PYTH_MAGIC.to_le_bytes());
    data[ATYPE_OFF..ATYPE_OFF + 4].copy_from_slice(&PRICE_ACCOUNT_TYPE.to_le_bytes());
    data[EXPO_OFF..EXPO_OFF + 4].copy_from_slice(&expo.to_le_bytes());
    data[AGG_PRICE_OFF..AGG_PRICE_OFF + 8].copy_from_slice(&price.to_le_bytes());
    data[AGG_CONF_OFF..AGG_CONF_OFF + 8].copy_from_slice(&conf.to_le_bytes());
    data[AGG_STATUS_OFF..AGG_STATUS_OFF + 4].copy_from_slice(&STATUS_TRADING.to_le_bytes());
    data[AGG_PUB_SLOT_OFF..AGG_PUB_SLOT_OFF + 8].copy_from_slice(&publish_slot.to_le_bytes());
    data
}
