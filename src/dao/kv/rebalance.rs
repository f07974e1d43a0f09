use crate::error::Error;
use crate::keys;
use crate::model::{RebalanceOutcome, Store};
use crate::provider::{KvCommand, SetOptions};

impl Store<RebalanceOutcome> {
    /// Write the outcome to `rebalance:last` and prepend it to the
    /// capped history in one pipeline.
    pub async fn record(
        &self,
        outcome: &RebalanceOutcome,
        history_limit: usize,
    ) -> Result<(), Error> {
        let body = serde_json::to_string(outcome)?;
        self.kv
            .pipeline(vec![
                KvCommand::Set {
                    key: keys::REBALANCE_LAST.to_string(),
                    value: body.clone(),
                    options: SetOptions::default(),
                },
                KvCommand::LPush {
                    key: keys::REBALANCE_HISTORY.to_string(),
                    value: body,
                },
                KvCommand::LTrim {
                    key: keys::REBALANCE_HISTORY.to_string(),
                    start: 0,
                    stop: history_limit as i64 - 1,
                },
            ])
            .await
    }

    pub async fn last(&self) -> Result<Option<RebalanceOutcome>, Error> {
        let value = self.kv.get(keys::REBALANCE_LAST).await?;
        Ok(value.and_then(|value| value.decode().ok()))
    }

    pub async fn history(
        &self,
        limit: usize,
    ) -> Result<Vec<RebalanceOutcome>, Error> {
        let entries = self
            .kv
            .lrange(keys::REBALANCE_HISTORY, 0, limit as i64 - 1)
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.decode().ok())
            .collect())
    }
}
