use actix_web::{get, post, web, HttpResponse, Result};
use serde::Serialize;
use tracing::info;

use crate::{
    configuration::{AppState, State},
    error::Error,
    handler::worker::{self, ProcessResult},
    model::{
        JobKind, JobPayload, RebalanceOutcome, RebalancePayload,
        RebalanceReason,
    },
    types::RebalanceTrigger,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RebalanceOutcome>,
}

/// Manual rebalance trigger: enqueue and attempt to process the job
/// within this request; fall back to the worker loop when the gate is
/// held.
#[post("/rebalance")]
pub async fn index(
    state: web::Data<AppState<State>>,
    body: web::Json<RebalanceTrigger>,
) -> Result<HttpResponse, Error> {
    if !body.manual {
        let outcome = state.store.rebalances.last().await?;
        return Ok(HttpResponse::Ok().json(Response {
            queued: false,
            outcome,
        }));
    }

    let job = state
        .store
        .queue
        .enqueue(
            JobKind::Rebalance,
            JobPayload::Rebalance(RebalancePayload {
                reason: RebalanceReason::Manual,
                context: None,
            }),
            None,
        )
        .await?
        .ok_or(Error::AlreadyInProgress)?;
    info!("manual rebalance requested: job {}", &job.id);

    let handle = state
        .store
        .queue
        .claim_by_id(
            &job.id,
            10,
            state.config.worker_lock_ttl,
            state.config.job_max_age,
        )
        .await?;
    let outcome = match handle {
        Some(handle) => match worker::process(&state, &handle).await {
            ProcessResult::Rebalance(outcome) => Some(outcome),
            _ => state.store.rebalances.last().await?,
        },
        None => None,
    };

    Ok(HttpResponse::Ok().json(Response {
        queued: true,
        outcome,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub last: Option<RebalanceOutcome>,
    pub history: Vec<RebalanceOutcome>,
}

#[get("/rebalance")]
pub async fn get_index(
    state: web::Data<AppState<State>>,
) -> Result<HttpResponse, Error> {
    let last = state.store.rebalances.last().await?;
    let history = state
        .store
        .rebalances
        .history(state.config.rebalance_history_limit)
        .await?;
    Ok(HttpResponse::Ok().json(HistoryResponse { last, history }))
}
