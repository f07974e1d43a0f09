use crate::error::Error;
use crate::keys;
use crate::model::{SettlementStatus, Store};
use crate::provider::{KvCommand, SetOptions};

impl Store<SettlementStatus> {
    /// Persist the status under both keys. The address-keyed copy is
    /// canonical for deduplication; the job-keyed copy serves lookups.
    pub async fn put_status(
        &self,
        status: &SettlementStatus,
    ) -> Result<(), Error> {
        let body = serde_json::to_string(status)?;
        self.kv
            .pipeline(vec![
                KvCommand::Set {
                    key: keys::settlement_user(&status.address),
                    value: body.clone(),
                    options: SetOptions::default(),
                },
                KvCommand::Set {
                    key: keys::settlement_job(&status.job_id),
                    value: body,
                    options: SetOptions::default(),
                },
            ])
            .await
    }

    pub async fn get_by_address(
        &self,
        address: &str,
    ) -> Result<Option<SettlementStatus>, Error> {
        let value = self.kv.get(&keys::settlement_user(address)).await?;
        Ok(value.and_then(|value| value.decode().ok()))
    }

    pub async fn get_by_job(
        &self,
        job_id: &str,
    ) -> Result<Option<SettlementStatus>, Error> {
        let value = self.kv.get(&keys::settlement_job(job_id)).await?;
        Ok(value.and_then(|value| value.decode().ok()))
    }

    /// Clear a prior settlement's records so a new request can be
    /// accepted: the canonical status, its job copy, and the dedup key.
    pub async fn clear_for_address(
        &self,
        address: &str,
        job_id: Option<&str>,
    ) -> Result<(), Error> {
        let mut commands = vec![
            KvCommand::Del {
                key: keys::settlement_user(address),
            },
            KvCommand::Del {
                key: keys::job_dedupe(&keys::settlement_dedupe(address)),
            },
        ];
        if let Some(job_id) = job_id {
            commands.push(KvCommand::Del {
                key: keys::settlement_job(job_id),
            });
        }
        self.kv.pipeline(commands).await
    }

    /// Prepend to the capped settlement history ring.
    pub async fn push_history(
        &self,
        status: &SettlementStatus,
        limit: usize,
    ) -> Result<(), Error> {
        self.kv
            .pipeline(vec![
                KvCommand::LPush {
                    key: keys::SETTLEMENT_HISTORY.to_string(),
                    value: serde_json::to_string(status)?,
                },
                KvCommand::LTrim {
                    key: keys::SETTLEMENT_HISTORY.to_string(),
                    start: 0,
                    stop: limit as i64 - 1,
                },
            ])
            .await
    }

    pub async fn history(
        &self,
        limit: usize,
    ) -> Result<Vec<SettlementStatus>, Error> {
        let entries = self
            .kv
            .lrange(keys::SETTLEMENT_HISTORY, 0, limit as i64 - 1)
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.decode().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::now_ms;
    use crate::model::SettlementState;
    use crate::provider::MemoryKv;

    fn status(job_id: &str, state: SettlementState) -> SettlementStatus {
        SettlementStatus {
            job_id: job_id.to_string(),
            request_id: format!("req-{job_id}"),
            address: String::from("0xAbCd"),
            share: 0.25,
            plan: Vec::new(),
            state,
            created_at: now_ms(),
            updated_at: now_ms(),
            transactions: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_status_keyed_both_ways() {
        let store: Store<SettlementStatus> =
            Store::new(MemoryKv::handle());
        let status = status("job-1", SettlementState::Queued);
        store.put_status(&status).await.unwrap();

        let by_address = store
            .get_by_address("0xABCD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_address.job_id, "job-1");

        let by_job = store.get_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(by_job.address, "0xAbCd");
    }

    #[tokio::test]
    async fn test_clear_removes_both_copies() {
        let store: Store<SettlementStatus> =
            Store::new(MemoryKv::handle());
        let status = status("job-2", SettlementState::Failed);
        store.put_status(&status).await.unwrap();

        store
            .clear_for_address("0xabcd", Some("job-2"))
            .await
            .unwrap();
        assert!(store.get_by_address("0xabcd").await.unwrap().is_none());
        assert!(store.get_by_job("job-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_ring_is_capped() {
        let store: Store<SettlementStatus> =
            Store::new(MemoryKv::handle());
        for i in 0..5 {
            store
                .push_history(
                    &status(&format!("job-{i}"), SettlementState::Executed),
                    3,
                )
                .await
                .unwrap();
        }
        let history = store.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].job_id, "job-4");
    }
}
