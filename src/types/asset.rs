use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::{fmt, io, str::FromStr};

use crate::helpers::address_checksum;

/// Sentinel the quote aggregator uses for the chain's native currency.
pub const NATIVE_TOKEN_SENTINEL: &str =
    "0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Native,
    Token,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssetKind::Native => write!(f, "native"),
            AssetKind::Token => write!(f, "token"),
        }
    }
}

impl FromStr for AssetKind {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<AssetKind, Self::Err> {
        match value {
            "native" => Ok(AssetKind::Native),
            "token" => Ok(AssetKind::Token),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "AssetKind not supported",
            )),
        }
    }
}

/// Static configuration of one vault asset. Exactly one configured asset
/// is native; token assets carry a contract address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub kind: AssetKind,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<Address>,
    pub decimals: u8,
    pub price_feed_id: String,
}

impl Asset {
    /// 10^decimals, one whole unit in minor units.
    pub fn unit(&self) -> U256 {
        U256::from(10u64).pow(U256::from(self.decimals))
    }

    /// The token identifier the aggregator expects for this asset.
    pub fn quote_token(&self) -> String {
        match self.kind {
            AssetKind::Native => NATIVE_TOKEN_SENTINEL.to_string(),
            AssetKind::Token => self
                .token_address
                .as_ref()
                .map(address_checksum)
                .unwrap_or_default(),
        }
    }
}
