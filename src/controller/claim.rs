use actix_web::{get, post, web, HttpResponse, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    configuration::{AppState, State},
    dao::LockOperation,
    error::Error,
    handler::settlement::{self, EnqueueOutcome},
    handler::worker::{self, ProcessResult},
    helpers::now_ms,
    model::SettlementStatus,
    signature::{check_freshness, claim_message, verify_personal},
    types::ClaimRequest,
};

/// How many queued jobs a synchronous claim may step over to reach its
/// own settlement.
const CLAIM_MAX_SKIP: usize = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub queued: bool,
    pub status: SettlementStatus,
}

/// Signed claim: plan the pro-rata settlement, enqueue it, and when the
/// queue gate is free execute it within this request.
#[post("/claim")]
pub async fn index(
    state: web::Data<AppState<State>>,
    body: web::Json<ClaimRequest>,
) -> Result<HttpResponse, Error> {
    let address = crate::helpers::parse_address(&body.address)?;
    check_freshness(body.timestamp, now_ms())?;
    let message = claim_message(&body.address, body.timestamp);
    verify_personal(&message, &body.signature, address)?;

    let address_lower = body.address.to_lowercase();
    let lock = state
        .store
        .locks
        .acquire(
            LockOperation::Settlement,
            Some(&address_lower),
            state.config.request_lock_ttl,
        )
        .await?;
    if !lock.acquired {
        return Err(Error::AlreadyInProgress);
    }

    let outcome = settlement::enqueue(&state, &address_lower).await;
    lock.release().await?;

    match outcome? {
        EnqueueOutcome::Existing(status) => {
            Ok(HttpResponse::Ok().json(Response {
                queued: false,
                status,
            }))
        },
        EnqueueOutcome::Queued { job, status } => {
            // best effort synchronous execution; when the gate is busy
            // the worker loop picks the job up instead
            let handle = state
                .store
                .queue
                .claim_by_id(
                    &job.id,
                    CLAIM_MAX_SKIP,
                    state.config.worker_lock_ttl,
                    state.config.job_max_age,
                )
                .await?;
            let status = match handle {
                Some(handle) => {
                    info!("executing settlement {} synchronously", &job.id);
                    match worker::process(&state, &handle).await {
                        ProcessResult::Settlement(status) => status,
                        _ => state
                            .store
                            .settlements
                            .get_by_job(&job.id)
                            .await?
                            .unwrap_or(status),
                    }
                },
                None => status,
            };
            Ok(HttpResponse::Ok().json(Response {
                queued: true,
                status,
            }))
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct Query {
    address: String,
}

/// Latest settlement status for one depositor.
#[get("/claim")]
pub async fn get_index(
    state: web::Data<AppState<State>>,
    query: web::Query<Query>,
) -> Result<HttpResponse, Error> {
    let status = state
        .store
        .settlements
        .get_by_address(&query.address.to_lowercase())
        .await?;
    match status {
        Some(status) => Ok(HttpResponse::Ok().json(status)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": "no settlement for address",
        }))),
    }
}
