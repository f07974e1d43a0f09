use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::{fmt, io, str::FromStr};

use crate::helpers::u256_string;
use crate::types::AssetKind;

/// One asset's pro-rata slice of a settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransferPlan {
    pub asset_id: String,
    pub symbol: String,
    pub kind: AssetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    pub decimals: u8,
    #[serde(with = "u256_string")]
    pub amount_minor_units: U256,
    pub amount_formatted: String,
}

/// Cumulative per-depositor totals, stored as a field hash under
/// `user:stats:<address>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub address: String,
    pub total_transactions: u64,
    #[serde(with = "u256_string")]
    pub total_value_minor_units: U256,
    pub last_transaction_hash: Option<String>,
    pub last_transaction_timestamp: Option<i64>,
    pub settled_at: Option<i64>,
}

/// A validated deposit, stored once per hash under `tx:<hash>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositTransaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    #[serde(with = "u256_string")]
    pub value_minor_units: U256,
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: i64,
    pub chain_id: u64,
    pub confirmations: u64,
}

/// One depositor's continuous allocation vote. `weight` and
/// `deposit_minor_units` are refreshed from the live ledger on every
/// aggregation; the stored copies are fallbacks, not sources of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationVote {
    pub proposal_id: String,
    pub address: String,
    pub eth_percent: u8,
    pub weight: f64,
    #[serde(with = "u256_string")]
    pub deposit_minor_units: U256,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTotals {
    pub proposal_id: String,
    pub weighted_eth_percent: f64,
    pub total_weight: f64,
    pub total_voters: u32,
}

#[derive(Debug, Clone)]
pub struct VoteResults {
    pub totals: VoteTotals,
    pub votes: Vec<AllocationVote>,
}

/// Cached oracle price, stored under `price:snapshot:<assetId>` with a
/// TTL. `price_raw` is the integer price at `10^price_decimals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub asset_id: String,
    pub symbol: String,
    pub price_usd: f64,
    pub source: String,
    pub updated_at: i64,
    pub expires_at: i64,
    pub price_decimals: u8,
    #[serde(with = "u256_string")]
    pub price_raw: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Rebalance,
    Settlement,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobKind::Rebalance => write!(f, "rebalance"),
            JobKind::Settlement => write!(f, "settlement"),
        }
    }
}

impl FromStr for JobKind {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<JobKind, Self::Err> {
        match value {
            "rebalance" => Ok(JobKind::Rebalance),
            "settlement" => Ok(JobKind::Settlement),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "JobKind not supported",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceReason {
    Deposit,
    Vote,
    Manual,
}

impl fmt::Display for RebalanceReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RebalanceReason::Deposit => write!(f, "deposit"),
            RebalanceReason::Vote => write!(f, "vote"),
            RebalanceReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalancePayload {
    pub reason: RebalanceReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementPayload {
    pub address: String,
    pub share: f64,
    pub plan: Vec<AssetTransferPlan>,
    #[serde(with = "u256_string")]
    pub total_deposits_minor_units: U256,
    pub request_id: String,
    pub requested_at: i64,
}

/// Payloads are distinguished by the sibling `type` field on the job;
/// the settlement variant is tried first because its required fields
/// cannot appear on a rebalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobPayload {
    Settlement(SettlementPayload),
    Rebalance(RebalancePayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub payload: JobPayload,
    pub attempts: u32,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementState {
    Queued,
    Executing,
    Executed,
    DryRun,
    Failed,
}

impl SettlementState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Executed
                | SettlementState::DryRun
                | SettlementState::Failed
        )
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SettlementState::Queued => write!(f, "queued"),
            SettlementState::Executing => write!(f, "executing"),
            SettlementState::Executed => write!(f, "executed"),
            SettlementState::DryRun => write!(f, "dry-run"),
            SettlementState::Failed => write!(f, "failed"),
        }
    }
}

/// Latest settlement attempt for a depositor. The address-keyed copy is
/// canonical for deduplication; the job-keyed copy serves lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStatus {
    pub job_id: String,
    pub request_id: String,
    pub address: String,
    pub share: f64,
    pub plan: Vec<AssetTransferPlan>,
    pub state: SettlementState,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceMode {
    Executed,
    DryRun,
    Skipped,
}

impl fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RebalanceMode::Executed => write!(f, "executed"),
            RebalanceMode::DryRun => write!(f, "dry-run"),
            RebalanceMode::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-asset valuation snapshot attached to a rebalance outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTotal {
    pub asset_id: String,
    pub symbol: String,
    #[serde(with = "u256_string")]
    pub balance_minor_units: U256,
    #[serde(with = "u256_string")]
    pub usd_raw: U256,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub sell_asset: String,
    pub buy_asset: String,
    #[serde(with = "u256_string")]
    pub sell_amount_minor_units: U256,
    #[serde(with = "u256_string")]
    pub buy_amount_minor_units: U256,
    pub sell_amount_formatted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceOutcome {
    pub job_id: String,
    pub reason: RebalanceReason,
    pub mode: RebalanceMode,
    pub timestamp: i64,
    pub totals: Vec<AssetTotal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub actions: Vec<ActionResult>,
}
