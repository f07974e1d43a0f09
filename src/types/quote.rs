use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::helpers::{u256_opt_string, u256_string};

/// Parameters of one quote request against the aggregator's
/// allowance-holder endpoint.
#[derive(Debug, Clone)]
pub struct QuoteParams {
    pub sell_token: String,
    pub buy_token: String,
    pub sell_amount: U256,
    pub taker: String,
    pub chain_id: u64,
    pub slippage_bps: u32,
}

/// The subset of the aggregator response the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapQuote {
    #[serde(with = "u256_string")]
    pub buy_amount: U256,
    #[serde(with = "u256_string")]
    pub sell_amount: U256,
    #[serde(default)]
    pub issues: Option<QuoteIssues>,
    pub transaction: QuoteTransaction,
    #[serde(default)]
    pub route: Option<QuoteRoute>,
}

impl SwapQuote {
    /// Spender that must be approved before selling a token; the
    /// aggregator reports it under `issues.allowance`, falling back to
    /// the transaction target.
    pub fn allowance_spender(&self) -> &str {
        self.issues
            .as_ref()
            .and_then(|issues| issues.allowance.as_ref())
            .and_then(|allowance| allowance.spender.as_deref())
            .unwrap_or(&self.transaction.to)
    }

    /// Liquidity sources of the route, for outcome reporting.
    pub fn route_sources(&self) -> Vec<String> {
        self.route
            .as_ref()
            .map(|route| {
                route
                    .fills
                    .iter()
                    .map(|fill| fill.source.to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteIssues {
    #[serde(default)]
    pub allowance: Option<AllowanceIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceIssue {
    #[serde(default)]
    pub spender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteTransaction {
    pub to: String,
    pub data: String,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default, with = "u256_opt_string")]
    pub value: Option<U256>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRoute {
    #[serde(default)]
    pub fills: Vec<RouteFill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFill {
    pub source: String,
    #[serde(default)]
    pub proportion_bps: Option<u32>,
}
