use alloy::primitives::U256;
use bigdecimal::BigDecimal;
use futures::future::join_all;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::Error;
use crate::helpers::now_ms;
use crate::keys;
use crate::model::{PriceSnapshot, Store};
use crate::provider::{PriceSource, SetOptions};
use crate::types::Asset;

/// Shared scale of every price snapshot. The planner rejects mixed
/// scales, so this is a single constant rather than per-asset config.
pub const PRICE_DECIMALS: u8 = 8;

const PRICE_SOURCE: &str = "coinbase-spot";

/// `round(priceUsd · 10^8)` from the oracle's decimal string, without
/// a float in between.
pub fn price_raw_from_amount(amount: &str) -> Result<U256, Error> {
    let decimal = BigDecimal::from_str(amount.trim())?;
    if decimal <= BigDecimal::from(0) {
        return Err(Error::PriceUnavailable(format!(
            "non-positive price {amount}"
        )));
    }
    let raw = (decimal * BigDecimal::from(10u64.pow(PRICE_DECIMALS as u32)))
        .with_scale_round(0, bigdecimal::RoundingMode::HalfUp);
    U256::from_str(&raw.to_string())
        .map_err(|_| Error::PriceUnavailable(format!("price {amount}")))
}

impl Store<PriceSnapshot> {
    /// Cached snapshot if fresh, otherwise fetch from the oracle and
    /// store with the TTL. When the oracle fails, any snapshot still in
    /// the store is better than nothing; with none, the caller aborts.
    pub async fn get_price(
        &self,
        source: &dyn PriceSource,
        asset: &Asset,
        ttl: Duration,
    ) -> Result<PriceSnapshot, Error> {
        let key = keys::price_snapshot(&asset.id);
        let cached: Option<PriceSnapshot> = match self.kv.get(&key).await? {
            Some(value) => value.decode().ok(),
            None => None,
        };
        if let Some(snapshot) = &cached {
            if snapshot.expires_at > now_ms() {
                return Ok(snapshot.clone());
            }
        }

        match self.fetch_and_store(source, asset, ttl).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => match cached {
                Some(snapshot) => {
                    warn!(
                        "price fetch for {} failed ({}), serving stale snapshot",
                        &asset.id, error
                    );
                    Ok(snapshot)
                },
                None => Err(error),
            },
        }
    }

    /// Parallel batch fetch. Only successful entries are returned; the
    /// rebalance treats an absent asset as fatal for the current job.
    pub async fn get_prices(
        &self,
        source: &dyn PriceSource,
        assets: &[Asset],
        ttl: Duration,
    ) -> Result<HashMap<String, PriceSnapshot>, Error> {
        let fetches = assets
            .iter()
            .map(|asset| self.get_price(source, asset, ttl));
        let mut prices = HashMap::new();
        for (asset, result) in
            assets.iter().zip(join_all(fetches).await)
        {
            match result {
                Ok(snapshot) => {
                    prices.insert(asset.id.clone(), snapshot);
                },
                Err(error) => {
                    warn!("no price for {}: {}", &asset.id, error)
                },
            }
        }
        Ok(prices)
    }

    async fn fetch_and_store(
        &self,
        source: &dyn PriceSource,
        asset: &Asset,
        ttl: Duration,
    ) -> Result<PriceSnapshot, Error> {
        let amount = source.get_spot_price(&asset.price_feed_id).await?;
        let price_raw = price_raw_from_amount(&amount)?;
        let price_usd: f64 = amount.trim().parse().unwrap_or(0.0);
        if !price_usd.is_finite() || price_usd <= 0.0 {
            return Err(Error::PriceUnavailable(asset.id.clone()));
        }

        let now = now_ms();
        let snapshot = PriceSnapshot {
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            price_usd,
            source: PRICE_SOURCE.to_string(),
            updated_at: now,
            expires_at: now + ttl.as_millis() as i64,
            price_decimals: PRICE_DECIMALS,
            price_raw,
        };
        self.kv
            .set(
                &keys::price_snapshot(&asset.id),
                &serde_json::to_string(&snapshot)?,
                SetOptions::ex(ttl),
            )
            .await?;
        Ok(snapshot)
    }
}
