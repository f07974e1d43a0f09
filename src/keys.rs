//! Centralized key-value store key schema
//!
//! Every key written by the stores is built here so controllers, handlers
//! and the sweepers cannot drift apart on key shapes.

/// Main job FIFO.
pub const JOBS_QUEUE: &str = "jobs:queue:main";

/// Global single-consumer gate for the job queue.
pub const JOBS_GATE: &str = "jobs:lock:main";

/// Last rebalance outcome.
pub const REBALANCE_LAST: &str = "rebalance:last";

/// Capped list of recent rebalance outcomes.
pub const REBALANCE_HISTORY: &str = "rebalance:history";

/// Capped list of recent settlement statuses.
pub const SETTLEMENT_HISTORY: &str = "settlement:history";

/// Scan pattern over every depositor's stats hash.
pub const USER_STATS_PATTERN: &str = "user:stats:*";

/// Scan pattern over in-flight job records.
pub const JOBS_PROCESSING_PATTERN: &str = "jobs:processing:*";

pub fn tx(hash: &str) -> String {
    format!("tx:{}", hash.to_lowercase())
}

pub fn user_tx(address: &str) -> String {
    format!("user:tx:{}", address.to_lowercase())
}

pub fn user_stats(address: &str) -> String {
    format!("user:stats:{}", address.to_lowercase())
}

pub fn vote_records(proposal_id: &str) -> String {
    format!("allocvote:{}:records", proposal_id)
}

pub fn vote_totals(proposal_id: &str) -> String {
    format!("allocvote:{}:totals", proposal_id)
}

pub fn price_snapshot(asset_id: &str) -> String {
    format!("price:snapshot:{}", asset_id)
}

pub fn job_processing(job_id: &str) -> String {
    format!("jobs:processing:{}", job_id)
}

pub fn job_dedupe(raw: &str) -> String {
    format!("jobs:dedupe:{}", raw)
}

pub fn settlement_dedupe(address: &str) -> String {
    format!("settlement:{}", address.to_lowercase())
}

pub fn settlement_user(address: &str) -> String {
    format!("settlement:user:{}", address.to_lowercase())
}

pub fn settlement_job(job_id: &str) -> String {
    format!("settlement:job:{}", job_id)
}

pub fn operation_lock(operation: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => {
            format!("lock:operation:{}:{}", operation, id.to_lowercase())
        },
        None => format!("lock:operation:{}:global", operation),
    }
}
