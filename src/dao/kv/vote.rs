use alloy::primitives::U256;
use std::collections::HashMap;
use tracing::warn;

use crate::error::Error;
use crate::helpers::{clamp_percent, round4};
use crate::keys;
use crate::model::{
    AllocationVote, Store, UserStats, VoteResults, VoteTotals,
};
use crate::provider::KvCommand;

/// Fixed integer scale for vote weights: weight = deposit·10⁹/total,
/// truncated. All weight math happens at this scale; floats only leave
/// toward the UI.
const WEIGHT_SCALE: u128 = 1_000_000_000;

const F_WEIGHTED_ETH_PERCENT: &str = "weightedEthPercent";
const F_TOTAL_WEIGHT: &str = "totalWeight";
const F_TOTAL_VOTERS: &str = "totalVoters";

impl Store<AllocationVote> {
    /// Write or replace the voter's allocation. One vote per
    /// (proposal, address); single round-trip, no CAS.
    pub async fn record_vote(
        &self,
        vote: &AllocationVote,
    ) -> Result<(), Error> {
        self.kv
            .hset(
                &keys::vote_records(&vote.proposal_id),
                &vote.address.to_lowercase(),
                &serde_json::to_string(vote)?,
            )
            .await
    }

    pub async fn get_vote(
        &self,
        proposal_id: &str,
        address: &str,
    ) -> Result<Option<AllocationVote>, Error> {
        let value = self
            .kv
            .hget(
                &keys::vote_records(proposal_id),
                &address.to_lowercase(),
            )
            .await?;
        Ok(value.and_then(|value| value.decode().ok()))
    }

    /// All stored votes, tolerating both raw and pre-decoded shapes;
    /// garbage fields are skipped with a warning.
    pub async fn get_votes(
        &self,
        proposal_id: &str,
    ) -> Result<Vec<AllocationVote>, Error> {
        let records = self
            .kv
            .hgetall(&keys::vote_records(proposal_id))
            .await?;
        let mut votes = Vec::with_capacity(records.len());
        for (address, value) in records {
            match value.decode::<AllocationVote>() {
                Ok(vote) => votes.push(vote),
                Err(error) => {
                    warn!("skipping unparsable vote for {}: {}", address, error)
                },
            }
        }
        Ok(votes)
    }

    /// Recompute the deposit-weighted consensus from the live ledger,
    /// persist the refreshed per-vote weights and totals, and return
    /// them. Stateless and safe to run concurrently; the final write is
    /// last-writer-wins and the rebalance consumes the return value
    /// directly.
    pub async fn aggregate(
        &self,
        proposal_id: &str,
        ledger: &Store<UserStats>,
    ) -> Result<VoteResults, Error> {
        let mut votes = self.get_votes(proposal_id).await?;
        votes.sort_by(|a, b| a.address.cmp(&b.address));

        let stats = ledger.get_all_user_stats().await?;
        let deposits: HashMap<String, U256> = stats
            .iter()
            .map(|s| (s.address.clone(), s.total_value_minor_units))
            .collect();
        let total_deposits: U256 = stats
            .iter()
            .fold(U256::ZERO, |acc, s| acc + s.total_value_minor_units);

        let mut sum_weighted_pct: u128 = 0;
        let mut total_weight_scaled: u128 = 0;
        let mut total_voters: u32 = 0;

        for vote in votes.iter_mut() {
            let deposit = deposits
                .get(&vote.address.to_lowercase())
                .copied()
                .unwrap_or(U256::ZERO);

            let weight_scaled: u128 = if total_deposits > U256::ZERO {
                u128::try_from(
                    deposit * U256::from(WEIGHT_SCALE) / total_deposits,
                )
                .map_err(|_| {
                    Error::Numeric(String::from("vote weight out of range"))
                })?
            } else {
                0
            };

            let pct = u128::from(vote.eth_percent.min(100));
            sum_weighted_pct += weight_scaled * pct;
            total_weight_scaled += weight_scaled;
            if weight_scaled > 0 {
                total_voters += 1;
            }

            vote.deposit_minor_units = deposit;
            vote.weight = weight_scaled as f64 / WEIGHT_SCALE as f64;
        }

        // the ratio is taken before the participation clamp, so rounding
        // drift above 1.0 cannot skew the consensus
        let weighted_eth_percent = if total_weight_scaled > 0 {
            round4(clamp_percent(
                sum_weighted_pct as f64 / total_weight_scaled as f64,
            ))
        } else {
            0.0
        };
        let total_weight = total_weight_scaled.min(WEIGHT_SCALE) as f64
            / WEIGHT_SCALE as f64;

        let totals = VoteTotals {
            proposal_id: proposal_id.to_string(),
            weighted_eth_percent,
            total_weight,
            total_voters,
        };

        let records_key = keys::vote_records(proposal_id);
        let totals_key = keys::vote_totals(proposal_id);
        let mut commands = Vec::with_capacity(votes.len() + 3);
        for vote in &votes {
            commands.push(KvCommand::HSet {
                key: records_key.clone(),
                field: vote.address.to_lowercase(),
                value: serde_json::to_string(vote)?,
            });
        }
        commands.push(KvCommand::HSet {
            key: totals_key.clone(),
            field: F_WEIGHTED_ETH_PERCENT.to_string(),
            value: weighted_eth_percent.to_string(),
        });
        commands.push(KvCommand::HSet {
            key: totals_key.clone(),
            field: F_TOTAL_WEIGHT.to_string(),
            value: total_weight.to_string(),
        });
        commands.push(KvCommand::HSet {
            key: totals_key,
            field: F_TOTAL_VOTERS.to_string(),
            value: total_voters.to_string(),
        });
        self.kv.pipeline(commands).await?;

        Ok(VoteResults { totals, votes })
    }

    /// Drop the voter's record (after settlement) and refresh totals.
    pub async fn remove_vote(
        &self,
        proposal_id: &str,
        address: &str,
        ledger: &Store<UserStats>,
    ) -> Result<VoteResults, Error> {
        self.kv
            .hdel(
                &keys::vote_records(proposal_id),
                &address.to_lowercase(),
            )
            .await?;
        self.aggregate(proposal_id, ledger).await
    }

    /// Remove votes whose address has no live deposit (settled or never
    /// in the ledger). Returns the number removed.
    pub async fn sweep_stale(
        &self,
        proposal_id: &str,
        ledger: &Store<UserStats>,
    ) -> Result<u32, Error> {
        let votes = self.get_votes(proposal_id).await?;
        if votes.is_empty() {
            return Ok(0);
        }
        let stats = ledger.get_all_user_stats().await?;
        let deposits: HashMap<String, U256> = stats
            .iter()
            .map(|s| (s.address.clone(), s.total_value_minor_units))
            .collect();

        let mut removed = 0;
        for vote in &votes {
            let live = deposits
                .get(&vote.address.to_lowercase())
                .copied()
                .unwrap_or(U256::ZERO);
            if live == U256::ZERO {
                self.kv
                    .hdel(
                        &keys::vote_records(proposal_id),
                        &vote.address.to_lowercase(),
                    )
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(
                "stale-vote sweeper removed {} zero-deposit votes",
                removed
            );
            self.aggregate(proposal_id, ledger).await?;
        }
        Ok(removed)
    }

    /// Cached totals from the last aggregation, for cheap reads.
    pub async fn cached_totals(
        &self,
        proposal_id: &str,
    ) -> Result<Option<VoteTotals>, Error> {
        let fields = self
            .kv
            .hgetall(&keys::vote_totals(proposal_id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let plain = |name: &str| {
            fields.get(name).cloned().map(|value| value.into_plain())
        };
        Ok(Some(VoteTotals {
            proposal_id: proposal_id.to_string(),
            weighted_eth_percent: plain(F_WEIGHTED_ETH_PERCENT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            total_weight: plain(F_TOTAL_WEIGHT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            total_voters: plain(F_TOTAL_VOTERS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }))
    }

    /// Explicit reset of one proposal's votes and totals.
    pub async fn reset(&self, proposal_id: &str) -> Result<(), Error> {
        self.kv.del(&keys::vote_records(proposal_id)).await?;
        self.kv.del(&keys::vote_totals(proposal_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::now_ms;
    use crate::model::DepositTransaction;
    use crate::provider::{KvHandle, MemoryKv};

    const PROPOSAL: &str = "allocation-main";

    fn stores(
    ) -> (KvHandle, Store<AllocationVote>, Store<UserStats>) {
        let kv = MemoryKv::handle();
        (kv.clone(), Store::new(kv.clone()), Store::new(kv))
    }

    async fn fund(ledger: &Store<UserStats>, address: &str, wei: u128) {
        ledger
            .record_deposit(&DepositTransaction {
                hash: format!("0xfund{}{}", address.trim_start_matches("0x"), wei),
                from: address.to_string(),
                to: String::from(
                    "0x00000000000000000000000000000000000000aa",
                ),
                value_minor_units: U256::from(wei),
                block_number: 1,
                block_hash: String::from("0xblock"),
                timestamp: now_ms(),
                chain_id: 8453,
                confirmations: 3,
            })
            .await
            .unwrap();
    }

    fn vote(address: &str, pct: u8) -> AllocationVote {
        AllocationVote {
            proposal_id: PROPOSAL.to_string(),
            address: address.to_string(),
            eth_percent: pct,
            weight: 0.0,
            deposit_minor_units: U256::ZERO,
            timestamp: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_two_voter_weighted_mean() {
        let (_kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 3_000_000_000_000_000_000).await;
        fund(&ledger, "0xBbb", 1_000_000_000_000_000_000).await;

        votes.record_vote(&vote("0xAaa", 80)).await.unwrap();
        votes.record_vote(&vote("0xBbb", 0)).await.unwrap();

        let results = votes.aggregate(PROPOSAL, &ledger).await.unwrap();
        assert_eq!(results.totals.weighted_eth_percent, 60.0);
        assert_eq!(results.totals.total_weight, 1.0);
        assert_eq!(results.totals.total_voters, 2);

        let a = results
            .votes
            .iter()
            .find(|v| v.address == "0xAaa")
            .unwrap();
        assert_eq!(a.weight, 0.75);
        assert_eq!(
            a.deposit_minor_units,
            U256::from(3_000_000_000_000_000_000u128)
        );

        // totals are persisted for cheap reads
        let cached = votes
            .cached_totals(PROPOSAL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.weighted_eth_percent, 60.0);
        assert_eq!(cached.total_voters, 2);
    }

    #[tokio::test]
    async fn test_resubmission_replaces() {
        let (_kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 1_000).await;

        votes.record_vote(&vote("0xAaa", 20)).await.unwrap();
        votes.record_vote(&vote("0xAAA", 90)).await.unwrap();

        let results = votes.aggregate(PROPOSAL, &ledger).await.unwrap();
        assert_eq!(results.votes.len(), 1);
        assert_eq!(results.totals.weighted_eth_percent, 90.0);
        assert_eq!(results.totals.total_voters, 1);
    }

    #[tokio::test]
    async fn test_zero_ledger_zeroes_everything() {
        let (_kv, votes, ledger) = stores();
        votes.record_vote(&vote("0xAaa", 70)).await.unwrap();

        let results = votes.aggregate(PROPOSAL, &ledger).await.unwrap();
        assert_eq!(results.totals.weighted_eth_percent, 0.0);
        assert_eq!(results.totals.total_weight, 0.0);
        assert_eq!(results.totals.total_voters, 0);
        assert_eq!(results.votes[0].weight, 0.0);
    }

    #[tokio::test]
    async fn test_non_voters_dilute_participation() {
        let (_kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 1_000).await;
        fund(&ledger, "0xBbb", 3_000).await;

        votes.record_vote(&vote("0xAaa", 100)).await.unwrap();

        let results = votes.aggregate(PROPOSAL, &ledger).await.unwrap();
        // only a quarter of deposits voted, but consensus among voters
        // is still 100
        assert_eq!(results.totals.weighted_eth_percent, 100.0);
        assert_eq!(results.totals.total_weight, 0.25);
        assert_eq!(results.totals.total_voters, 1);
    }

    #[tokio::test]
    async fn test_remove_vote_refreshes_totals() {
        let (_kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 1_000).await;
        fund(&ledger, "0xBbb", 1_000).await;
        votes.record_vote(&vote("0xAaa", 100)).await.unwrap();
        votes.record_vote(&vote("0xBbb", 0)).await.unwrap();

        let results = votes
            .remove_vote(PROPOSAL, "0xAAA", &ledger)
            .await
            .unwrap();
        assert_eq!(results.totals.total_voters, 1);
        assert_eq!(results.totals.weighted_eth_percent, 0.0);
        assert_eq!(results.totals.total_weight, 0.5);
    }

    #[tokio::test]
    async fn test_sweeper_removes_settled_voters() {
        let (_kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 1_000).await;
        fund(&ledger, "0xBbb", 1_000).await;
        votes.record_vote(&vote("0xAaa", 100)).await.unwrap();
        votes.record_vote(&vote("0xBbb", 40)).await.unwrap();

        ledger.mark_user_settled("0xBbb").await.unwrap();

        let removed =
            votes.sweep_stale(PROPOSAL, &ledger).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = votes.get_votes(PROPOSAL).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address.to_lowercase(), "0xaaa");
    }

    #[tokio::test]
    async fn test_garbage_vote_is_skipped() {
        let (kv, votes, ledger) = stores();
        fund(&ledger, "0xAaa", 1_000).await;
        votes.record_vote(&vote("0xAaa", 50)).await.unwrap();
        kv.hset(&keys::vote_records(PROPOSAL), "0xbad", "not json")
            .await
            .unwrap();

        let results = votes.aggregate(PROPOSAL, &ledger).await.unwrap();
        assert_eq!(results.votes.len(), 1);
        assert_eq!(results.totals.weighted_eth_percent, 50.0);
    }
}
