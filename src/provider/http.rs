use async_trait::async_trait;
use reqwest::get;
use tracing::debug;

use crate::{
    configuration::Config,
    error::Error,
    types::{QuoteParams, SpotPriceResponse, SwapQuote},
};

#[derive(Debug, Clone)]
pub struct HTTP {
    pub config: Config,
}

impl HTTP {
    pub fn new(config: Config) -> Self {
        HTTP { config }
    }
}

/// Oracle capability consumed by the pricing cache.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Spot USD price for one trading pair, as the oracle's decimal
    /// string (parsed downstream without going through floats).
    async fn get_spot_price(&self, pair: &str) -> Result<String, Error>;
}

#[async_trait]
impl PriceSource for HTTP {
    async fn get_spot_price(&self, pair: &str) -> Result<String, Error> {
        let url = self.config.get_spot_price_url(pair);
        debug!("fetching spot price {}", &url);
        let json = get(url).await?.error_for_status()?;
        let body = json.json::<SpotPriceResponse>().await?;
        Ok(body.data.amount)
    }
}

/// Quote capability consumed by the rebalance planner. The production
/// implementation talks to the aggregator's allowance-holder endpoint.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn swap_quote(
        &self,
        params: &QuoteParams,
    ) -> Result<SwapQuote, Error>;
}

#[async_trait]
impl QuoteSource for HTTP {
    async fn swap_quote(
        &self,
        params: &QuoteParams,
    ) -> Result<SwapQuote, Error> {
        let url = self.config.get_quote_url(params);
        debug!("fetching quote {}", &url);
        let response = get(url).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Aggregator {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<SwapQuote>().await?)
    }
}
