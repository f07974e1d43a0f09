use std::time::Duration;
use tokio::time;
use tracing::error;

use crate::configuration::{AppState, State};
use crate::dao::JobHandle;
use crate::error::Error;
use crate::handler::{rebalance, settlement};
use crate::model::{JobKind, RebalanceOutcome, SettlementStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ProcessResult {
    Rebalance(RebalanceOutcome),
    Settlement(SettlementStatus),
    Failed(String),
}

/// The one logical worker: poll the queue and run whatever job the
/// gate hands out. Poll errors are logged and the loop continues.
pub async fn worker_task(app_state: AppState<State>) -> Result<(), Error> {
    let mut interval = time::interval(POLL_INTERVAL);
    tokio::spawn(async move {
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = poll_once(&app_state).await {
                error!("worker poll failed: {}", err);
            }
        }
    })
    .await?
}

/// Claim and process at most one job. Returns whether one was run.
pub async fn poll_once(state: &AppState<State>) -> Result<bool, Error> {
    let handle = state
        .store
        .queue
        .claim_next(state.config.worker_lock_ttl, state.config.job_max_age)
        .await?;
    match handle {
        Some(handle) => {
            process(state, &handle).await;
            Ok(true)
        },
        None => Ok(false),
    }
}

/// Execute one claimed job and settle its queue bookkeeping: ack on
/// success, fail-with-requeue on transient errors, drop otherwise.
/// Shared by the worker loop and the synchronous claim paths.
pub async fn process(
    state: &AppState<State>,
    handle: &JobHandle,
) -> ProcessResult {
    let result = match handle.job.kind {
        JobKind::Rebalance => {
            rebalance::execute(state, handle, &state.http, &state.http)
                .await
                .map(ProcessResult::Rebalance)
        },
        JobKind::Settlement => settlement::execute(state, handle)
            .await
            .map(ProcessResult::Settlement),
    };

    match result {
        Ok(processed) => {
            if let Err(err) = handle.ack().await {
                error!("ack failed for job {}: {}", &handle.job.id, err);
            }
            processed
        },
        Err(err) => {
            let requeue = err.is_transient();
            error!(
                "job {} ({}) failed{}: {}",
                &handle.job.id,
                handle.job.kind,
                if requeue { ", requeueing" } else { "" },
                err
            );
            if let Err(fail_err) = handle.fail(requeue).await {
                error!(
                    "fail bookkeeping for job {} broke: {}",
                    &handle.job.id, fail_err
                );
            }
            ProcessResult::Failed(err.to_string())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Config;
    use crate::handler::settlement::EnqueueOutcome;
    use crate::model::{
        DepositTransaction, JobPayload, RebalancePayload, RebalanceReason,
        SettlementState,
    };
    use crate::provider::{testing::MockEvm, MemoryKv, StorePool, HTTP};
    use alloy::primitives::U256;
    use std::sync::Arc;

    const CLAIMANT: &str = "0x1111111111111111111111111111111111111111";

    fn app() -> (Arc<MockEvm>, AppState<State>) {
        let mut config = Config::for_tests();
        config.settlement_execute = false;
        let mock = Arc::new(MockEvm::new(config.vault_address, 8453));
        let store = StorePool::new(MemoryKv::handle());
        let http = HTTP::new(config.clone());
        let state =
            AppState::new(State::new(config, store, mock.clone(), http));
        (mock, state)
    }

    #[tokio::test]
    async fn test_poll_empty_queue_is_a_noop() {
        let (_mock, state) = app();
        assert!(!poll_once(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_settlement_job_flows_through_the_worker() {
        let (mock, state) = app();
        mock.set_native_balance(
            state.config.vault_address,
            U256::from(1_000_000_000_000_000_000u128),
        );
        state
            .store
            .deposits
            .record_deposit(&DepositTransaction {
                hash: String::from("0xdead01"),
                from: CLAIMANT.to_string(),
                to: String::from(
                    "0x00000000000000000000000000000000000000aa",
                ),
                value_minor_units: U256::from(1_000u64),
                block_number: 7,
                block_hash: String::from("0xblock"),
                timestamp: crate::helpers::now_ms(),
                chain_id: 8453,
                confirmations: 3,
            })
            .await
            .unwrap();

        match crate::handler::settlement::enqueue(&state, CLAIMANT)
            .await
            .unwrap()
        {
            EnqueueOutcome::Queued { .. } => {},
            EnqueueOutcome::Existing(_) => panic!("expected a fresh job"),
        }

        assert!(poll_once(&state).await.unwrap());
        let status = state
            .store
            .settlements
            .get_by_address(CLAIMANT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, SettlementState::DryRun);

        // job acked: nothing left to claim, nothing processing
        assert!(!poll_once(&state).await.unwrap());
        assert!(!state.store.queue.is_processing(None).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_payload_fails_without_requeue() {
        let (_mock, state) = app();
        state
            .store
            .queue
            .enqueue(
                crate::model::JobKind::Settlement,
                JobPayload::Rebalance(RebalancePayload {
                    reason: RebalanceReason::Manual,
                    context: None,
                }),
                None,
            )
            .await
            .unwrap();

        assert!(poll_once(&state).await.unwrap());
        assert_eq!(state.store.queue.size().await.unwrap(), 0);
        assert!(!state.store.queue.is_processing(None).await.unwrap());
    }
}
