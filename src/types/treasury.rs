use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::helpers::u256_string;
use crate::types::AssetKind;

/// Point-in-time view of the vault's holdings. Read fresh from the
/// chain each time; never persisted as a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreasurySnapshot {
    pub wallet_address: String,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: u64,
    pub finalized_block_number: Option<u64>,
    pub balances: Vec<AssetBalance>,
}

impl TreasurySnapshot {
    pub fn balance_of(&self, asset_id: &str) -> U256 {
        self.balances
            .iter()
            .find(|balance| balance.asset_id == asset_id)
            .map(|balance| balance.minor_units)
            .unwrap_or(U256::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset_id: String,
    pub symbol: String,
    pub kind: AssetKind,
    pub decimals: u8,
    #[serde(with = "u256_string")]
    pub minor_units: U256,
}
