use actix_web::{get, post, web, HttpResponse, Result};
use alloy::primitives::U256;
use serde::Serialize;

use crate::{
    configuration::{AppState, State},
    dao::LockOperation,
    error::Error,
    helpers::now_ms,
    model::{
        AllocationVote, JobKind, JobPayload, RebalancePayload,
        RebalanceReason, VoteTotals,
    },
    signature::{check_freshness, verify_personal, vote_message},
    types::VoteRequest,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub vote: AllocationVote,
    pub totals: VoteTotals,
}

/// Record a signed allocation vote, re-aggregate, and queue a
/// rebalance toward the new consensus.
#[post("/vote")]
pub async fn index(
    state: web::Data<AppState<State>>,
    body: web::Json<VoteRequest>,
) -> Result<HttpResponse, Error> {
    let address = crate::helpers::parse_address(&body.address)?;
    check_freshness(body.timestamp, now_ms())?;
    let message = vote_message(body.eth_percent, body.timestamp);
    verify_personal(&message, &body.signature, address)?;

    let address_lower = body.address.to_lowercase();
    let stats = state
        .store
        .deposits
        .get_user_stats(&address_lower)
        .await?
        .ok_or(Error::NotADepositor)?;
    if stats.total_value_minor_units == U256::ZERO {
        return Err(Error::NotADepositor);
    }

    let lock = state
        .store
        .locks
        .acquire(
            LockOperation::Vote,
            Some(&address_lower),
            state.config.request_lock_ttl,
        )
        .await?;
    if !lock.acquired {
        return Err(Error::AlreadyInProgress);
    }

    let result = write_and_aggregate(&state, &body, &stats.address).await;
    lock.release().await?;
    let (vote, totals) = result?;

    Ok(HttpResponse::Ok().json(Response { vote, totals }))
}

async fn write_and_aggregate(
    state: &AppState<State>,
    body: &VoteRequest,
    address_lower: &str,
) -> Result<(AllocationVote, VoteTotals), Error> {
    let config = &state.config;
    let vote = AllocationVote {
        proposal_id: config.proposal_id.clone(),
        address: address_lower.to_string(),
        eth_percent: body.eth_percent.clamp(0, 100) as u8,
        weight: 0.0,
        deposit_minor_units: U256::ZERO,
        timestamp: body.timestamp,
    };
    state.store.votes.record_vote(&vote).await?;

    let results = state
        .store
        .votes
        .aggregate(&config.proposal_id, &state.store.deposits)
        .await?;
    let recorded = results
        .votes
        .iter()
        .find(|entry| entry.address == address_lower)
        .cloned()
        .unwrap_or(vote);

    state
        .store
        .queue
        .enqueue(
            JobKind::Rebalance,
            JobPayload::Rebalance(RebalancePayload {
                reason: RebalanceReason::Vote,
                context: None,
            }),
            None,
        )
        .await?;

    Ok((recorded, results.totals))
}

/// Current aggregation results; cheap cached read with a live
/// recompute fallback.
#[get("/vote")]
pub async fn get_index(
    state: web::Data<AppState<State>>,
) -> Result<HttpResponse, Error> {
    let totals = match state
        .store
        .votes
        .cached_totals(&state.config.proposal_id)
        .await?
    {
        Some(totals) => totals,
        None => {
            state
                .store
                .votes
                .aggregate(&state.config.proposal_id, &state.store.deposits)
                .await?
                .totals
        },
    };
    Ok(HttpResponse::Ok().json(totals))
}
