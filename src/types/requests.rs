use serde::{Deserialize, Serialize};

/// Deposit webhook body: the hash of an already-mined transfer to the
/// vault. Everything else is read back from the chain.
#[derive(Debug, Deserialize)]
pub struct DepositWebhook {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub address: String,
    pub eth_percent: i64,
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub address: String,
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct RebalanceTrigger {
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub processing: bool,
    pub rebalance_processing: bool,
    pub settlement_processing: bool,
    pub queue_size: u64,
}
