//! Push-updated price cache, one entry per asset index.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pyth::{parse_price_account, OracleError, PythPrice};
use crate::exchange::{AssetsList, Decimal, ORACLE_OFFSET};
use crate::provider::ChainClient;
use crate::synchronizer::follow_account;

/// Price of the stable asset (index 0), which has no feed.
pub const STABLE_PRICE: Decimal = Decimal::new(100_000_000, ORACLE_OFFSET);

/// Cached oracle price for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OraclePrice {
    pub price: Decimal,
    pub confidence: Decimal,
    pub publish_slot: u64,
    /// Local time the value was accepted
    pub received_at: DateTime<Utc>,
}

impl OraclePrice {
    pub fn from_pyth(pyth: &PythPrice) -> Result<Self, OracleError> {
        Ok(Self {
            price: pyth.to_decimal()?,
            confidence: pyth.confidence()?,
            publish_slot: pyth.publish_slot,
            received_at: Utc::now(),
        })
    }

    pub fn stable() -> Self {
        Self {
            price: STABLE_PRICE,
            confidence: Decimal::new(0, ORACLE_OFFSET),
            publish_slot: 0,
            received_at: Utc::now(),
        }
    }

    fn parse(data: &[u8]) -> Result<Self, OracleError> {
        parse_price_account(data).and_then(|pyth| Self::from_pyth(&pyth))
    }
}

/// Latest price per asset index, kept current by one subscription per feed.
///
/// A price is only ever replaced by a newer valid reading; an unparsable
/// update leaves the previous value in place.
pub struct PriceCache {
    prices: Arc<DashMap<u8, OraclePrice>>,
    feeds: Vec<(u8, Pubkey)>,
    tasks: Vec<JoinHandle<()>>,
}

impl PriceCache {
    /// Read every feed of `assets_list` once and subscribe to each.
    ///
    /// Fails if any feed is missing or unparsable: the agent must not start
    /// with a partial price set.
    pub async fn start(chain: Arc<dyn ChainClient>, assets_list: &AssetsList) -> Result<Self> {
        let prices = Arc::new(DashMap::new());
        prices.insert(0, OraclePrice::stable());

        let feeds: Vec<(u8, Pubkey)> = assets_list
            .assets
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, asset)| (index as u8, asset.feed_address))
            .collect();

        let mut streams = Vec::with_capacity(feeds.len());
        for &(index, feed) in &feeds {
            let stream = chain
                .subscribe_account(&feed)
                .await
                .with_context(|| format!("subscribing to oracle feed {feed}"))?;
            let account = chain
                .get_account(&feed)
                .await
                .with_context(|| format!("oracle feed {feed} for asset {index}"))?;
            let price = OraclePrice::parse(&account.data)
                .with_context(|| format!("oracle feed {feed} for asset {index}"))?;

            debug!(asset = index, feed = %feed, price = price.price.val, "Seeded oracle price");
            prices.insert(index, price);
            streams.push((index, feed, stream));
        }

        let tasks = streams
            .into_iter()
            .map(|(index, feed, stream)| {
                let prices = prices.clone();
                tokio::spawn(follow_account(chain.clone(), feed, stream, move |account| {
                    apply_update(&prices, index, &feed, &account.data)
                }))
            })
            .collect();

        info!(feeds = feeds.len(), "Oracle price cache seeded");

        Ok(Self {
            prices,
            feeds,
            tasks,
        })
    }

    pub fn get(&self, index: u8) -> Option<OraclePrice> {
        self.prices.get(&index).map(|p| *p)
    }

    pub fn price(&self, index: u8) -> Option<Decimal> {
        self.get(index).map(|p| p.price)
    }

    /// Replace the price of `index`.
    pub fn update(&self, index: u8, price: OraclePrice) {
        self.prices.insert(index, price);
    }

    /// `(asset index, feed)` for every subscribed feed.
    pub fn feeds(&self) -> &[(u8, Pubkey)] {
        &self.feeds
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Overwrite the prices in `assets_list` with cached ones.
    pub fn apply_to(&self, assets_list: &mut AssetsList) {
        for (index, asset) in assets_list.assets.iter_mut().enumerate() {
            if let Some(price) = self.price(index as u8) {
                asset.price = price;
            }
        }
    }

    /// Feeds whose last accepted update is older than `max_age`.
    pub fn stale_feeds(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<u8> {
        let mut stale: Vec<u8> = self
            .feeds
            .iter()
            .filter_map(|&(index, _)| {
                let price = self.get(index)?;
                (now - price.received_at > max_age).then_some(index)
            })
            .collect();
        stale.sort_unstable();
        stale
    }
}

impl Drop for PriceCache {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn apply_update(prices: &DashMap<u8, OraclePrice>, index: u8, feed: &Pubkey, data: &[u8]) {
    match OraclePrice::parse(data) {
        Ok(price) => {
            debug!(asset = index, price = price.price.val, "Oracle price updated");
            prices.insert(index, price);
        }
        Err(e) => {
            warn!(asset = index, feed = %feed, error = %e, "Unparsable oracle update, keeping last price");
        }
    }
}
