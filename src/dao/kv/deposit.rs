use alloy::primitives::U256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Error;
use crate::helpers::now_ms;
use crate::keys;
use crate::model::{DepositTransaction, Store, UserStats};
use crate::provider::{KvValue, SetOptions};

/// Ledger records expire after one year of inactivity.
const LEDGER_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const SCAN_BATCH: usize = 64;

const F_TOTAL_TRANSACTIONS: &str = "totalTransactions";
const F_TOTAL_VALUE: &str = "totalValueMinorUnits";
const F_LAST_HASH: &str = "lastTransactionHash";
const F_LAST_TIMESTAMP: &str = "lastTransactionTimestamp";
const F_SETTLED_AT: &str = "settledAt";

fn stats_from_fields(
    address: &str,
    fields: &HashMap<String, KvValue>,
) -> UserStats {
    let plain = |name: &str| {
        fields.get(name).cloned().map(KvValue::into_plain)
    };
    UserStats {
        address: address.to_lowercase(),
        total_transactions: plain(F_TOTAL_TRANSACTIONS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        total_value_minor_units: plain(F_TOTAL_VALUE)
            .and_then(|v| U256::from_str(&v).ok())
            .unwrap_or(U256::ZERO),
        last_transaction_hash: plain(F_LAST_HASH),
        last_transaction_timestamp: plain(F_LAST_TIMESTAMP)
            .and_then(|v| v.parse().ok()),
        settled_at: plain(F_SETTLED_AT).and_then(|v| v.parse().ok()),
    }
}

impl Store<UserStats> {
    /// Record a validated deposit. Idempotent on the transaction hash:
    /// the detail record is written NX first, so a replayed webhook (or
    /// a crash between detail write and index updates) cannot double
    /// count.
    pub async fn record_deposit(
        &self,
        tx: &DepositTransaction,
    ) -> Result<bool, Error> {
        let detail_key = keys::tx(&tx.hash);
        let accepted = self
            .kv
            .set(
                &detail_key,
                &serde_json::to_string(tx)?,
                SetOptions::nx_ex(LEDGER_TTL),
            )
            .await?;
        if !accepted {
            info!("deposit {} already recorded", &tx.hash);
            return Ok(false);
        }

        let from = tx.from.to_lowercase();
        let index_key = keys::user_tx(&from);
        let stats_key = keys::user_stats(&from);

        self.kv
            .zadd(&index_key, tx.timestamp as f64, &tx.hash.to_lowercase())
            .await?;

        let current = stats_from_fields(
            &from,
            &self.kv.hgetall(&stats_key).await?,
        );
        let total_value =
            current.total_value_minor_units + tx.value_minor_units;
        let total_transactions = current.total_transactions + 1;

        self.kv
            .hset(
                &stats_key,
                F_TOTAL_TRANSACTIONS,
                &total_transactions.to_string(),
            )
            .await?;
        self.kv
            .hset(&stats_key, F_TOTAL_VALUE, &total_value.to_string())
            .await?;
        self.kv
            .hset(&stats_key, F_LAST_HASH, &tx.hash.to_lowercase())
            .await?;
        self.kv
            .hset(&stats_key, F_LAST_TIMESTAMP, &tx.timestamp.to_string())
            .await?;
        self.kv.expire(&index_key, LEDGER_TTL).await?;
        self.kv.expire(&stats_key, LEDGER_TTL).await?;

        info!(
            "recorded deposit {} from {} value {}",
            &tx.hash, &from, tx.value_minor_units
        );
        Ok(true)
    }

    pub async fn get_user_stats(
        &self,
        address: &str,
    ) -> Result<Option<UserStats>, Error> {
        let fields = self
            .kv
            .hgetall(&keys::user_stats(&address.to_lowercase()))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(stats_from_fields(address, &fields)))
    }

    /// Every depositor's stats, via cursor scan.
    pub async fn get_all_user_stats(
        &self,
    ) -> Result<Vec<UserStats>, Error> {
        let mut stats = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self
                .kv
                .scan(cursor, keys::USER_STATS_PATTERN, SCAN_BATCH)
                .await?;
            for key in page {
                let address = key.trim_start_matches("user:stats:");
                let fields = self.kv.hgetall(&key).await?;
                if !fields.is_empty() {
                    stats.push(stats_from_fields(address, &fields));
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(stats)
    }

    /// Sum of every depositor's recorded total, the denominator of all
    /// share math.
    pub async fn total_deposits(&self) -> Result<U256, Error> {
        let stats = self.get_all_user_stats().await?;
        Ok(stats
            .iter()
            .fold(U256::ZERO, |acc, s| acc + s.total_value_minor_units))
    }

    /// Zero the depositor's total and stamp the settlement time. Prior
    /// transaction records are kept.
    pub async fn mark_user_settled(
        &self,
        address: &str,
    ) -> Result<(), Error> {
        let stats_key = keys::user_stats(&address.to_lowercase());
        self.kv.hset(&stats_key, F_TOTAL_VALUE, "0").await?;
        self.kv
            .hset(&stats_key, F_SETTLED_AT, &now_ms().to_string())
            .await?;
        Ok(())
    }

    /// Recent deposits of one address, newest first.
    pub async fn list_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<DepositTransaction>, Error> {
        let hashes = self
            .kv
            .zrange(
                &keys::user_tx(&address.to_lowercase()),
                0,
                limit as i64 - 1,
                true,
            )
            .await?;
        let mut transactions = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(value) = self.kv.get(&keys::tx(&hash)).await? {
                if let Ok(tx) = value.decode::<DepositTransaction>() {
                    transactions.push(tx);
                }
            }
        }
        Ok(transactions)
    }
}
