use alloy::primitives::{Address, U256};
use tracing::{info, warn};

use crate::configuration::{AppState, State};
use crate::dao::JobHandle;
use crate::error::Error;
use crate::handler::treasury;
use crate::helpers::{format_minor_units, now_ms, parse_address};
use crate::keys;
use crate::model::{
    AssetTransferPlan, Job, JobKind, JobPayload, RebalancePayload,
    RebalanceReason, SettlementPayload, SettlementState, SettlementStatus,
};
use crate::provider::TxRequest;
use crate::types::{Asset, AssetKind, TreasurySnapshot};

/// Share ratios leave integer space only for display.
const SHARE_SCALE: u128 = 1_000_000_000;

/// Result of a settlement enqueue attempt: either a fresh job or the
/// status that already owns this depositor's settlement window.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued {
        job: Job,
        status: SettlementStatus,
    },
    Existing(SettlementStatus),
}

/// Pro-rata slice of every vault asset: `amountᵢ = balᵢ·c/d` in exact
/// integer arithmetic, dust rounding against the claimant by at most
/// one minor unit per asset.
pub fn compute_plan(
    assets: &[Asset],
    snapshot: &TreasurySnapshot,
    claimant_minor_units: U256,
    total_deposits_minor_units: U256,
) -> Vec<AssetTransferPlan> {
    assets
        .iter()
        .map(|asset| {
            let balance = snapshot.balance_of(&asset.id);
            let amount = if total_deposits_minor_units > U256::ZERO {
                balance * claimant_minor_units / total_deposits_minor_units
            } else {
                U256::ZERO
            };
            AssetTransferPlan {
                asset_id: asset.id.clone(),
                symbol: asset.symbol.clone(),
                kind: asset.kind,
                token_address: asset
                    .token_address
                    .as_ref()
                    .map(|address| format!("{address:#x}")),
                decimals: asset.decimals,
                amount_minor_units: amount,
                amount_formatted: format_minor_units(
                    amount,
                    asset.decimals,
                ),
            }
        })
        .collect()
}

fn share_ratio(claimant: U256, total: U256) -> f64 {
    if total == U256::ZERO {
        return 0.0;
    }
    let scaled = u128::try_from(claimant * U256::from(SHARE_SCALE) / total)
        .unwrap_or(SHARE_SCALE);
    scaled as f64 / SHARE_SCALE as f64
}

/// Plan and enqueue a settlement for a verified claimant, enforcing
/// the one-live-settlement-per-address window: a stale non-terminal
/// status is displaced, an executed one is displaced only once the
/// depositor has new deposits, anything else is returned as-is.
pub async fn enqueue(
    state: &AppState<State>,
    address: &str,
) -> Result<EnqueueOutcome, Error> {
    let config = &state.config;
    let address_lower = address.to_lowercase();

    let stats = state
        .store
        .deposits
        .get_user_stats(&address_lower)
        .await?
        .ok_or(Error::NotADepositor)?;
    let claimant = stats.total_value_minor_units;
    if claimant == U256::ZERO {
        return Err(Error::NothingToClaim);
    }

    if let Some(existing) = state
        .store
        .settlements
        .get_by_address(&address_lower)
        .await?
    {
        let age_ms = now_ms().saturating_sub(existing.updated_at);
        let stale = age_ms > config.settlement_max_age.as_millis() as i64;
        match existing.state {
            SettlementState::Queued
            | SettlementState::Executing
            | SettlementState::Failed => {
                if !stale {
                    return Ok(EnqueueOutcome::Existing(existing));
                }
                warn!(
                    "displacing stale {} settlement for {}",
                    existing.state, &address_lower
                );
                state
                    .store
                    .settlements
                    .clear_for_address(
                        &address_lower,
                        Some(&existing.job_id),
                    )
                    .await?;
            },
            SettlementState::Executed | SettlementState::DryRun => {
                // claimant > 0 here, so deposits arrived after the
                // settlement; the old record no longer binds
                state
                    .store
                    .settlements
                    .clear_for_address(
                        &address_lower,
                        Some(&existing.job_id),
                    )
                    .await?;
            },
        }
    }

    let total_deposits = state.store.deposits.total_deposits().await?;
    if total_deposits == U256::ZERO {
        return Err(Error::NothingToClaim);
    }

    let snapshot =
        treasury::snapshot(state.evm.as_ref(), &config.assets).await?;
    let plan =
        compute_plan(&config.assets, &snapshot, claimant, total_deposits);
    let payload = SettlementPayload {
        address: address_lower.clone(),
        share: share_ratio(claimant, total_deposits),
        plan: plan.clone(),
        total_deposits_minor_units: total_deposits,
        request_id: uuid::Uuid::new_v4().to_string(),
        requested_at: now_ms(),
    };

    let job = state
        .store
        .queue
        .enqueue(
            JobKind::Settlement,
            JobPayload::Settlement(payload.clone()),
            Some((
                &keys::settlement_dedupe(&address_lower),
                config.settlement_max_age,
            )),
        )
        .await?;

    let job = match job {
        Some(job) => job,
        None => {
            // another writer won the dedup race; their status stands
            let existing = state
                .store
                .settlements
                .get_by_address(&address_lower)
                .await?;
            return match existing {
                Some(existing) => Ok(EnqueueOutcome::Existing(existing)),
                None => Err(Error::AlreadyInProgress),
            };
        },
    };

    let now = now_ms();
    let status = SettlementStatus {
        job_id: job.id.clone(),
        request_id: payload.request_id.clone(),
        address: address_lower,
        share: payload.share,
        plan,
        state: SettlementState::Queued,
        created_at: now,
        updated_at: now,
        transactions: None,
        error: None,
    };
    state.store.settlements.put_status(&status).await?;

    Ok(EnqueueOutcome::Queued { job, status })
}

/// Execute a claimed settlement job: one transfer per planned asset,
/// then ledger zeroing, vote removal and a follow-up rebalance. Any
/// transfer failure leaves the ledger and vote untouched and marks the
/// status failed; the job must not be requeued.
pub async fn execute(
    state: &AppState<State>,
    handle: &JobHandle,
) -> Result<SettlementStatus, Error> {
    let config = &state.config;
    let payload = match &handle.job.payload {
        JobPayload::Settlement(payload) => payload.clone(),
        JobPayload::Rebalance(_) => {
            return Err(Error::JobPayload(String::from(
                "settlement job carries a rebalance payload",
            )))
        },
    };
    let claimant = parse_address(&payload.address)?;

    let mut status = SettlementStatus {
        job_id: handle.job.id.clone(),
        request_id: payload.request_id.clone(),
        address: payload.address.clone(),
        share: payload.share,
        plan: payload.plan.clone(),
        state: SettlementState::Executing,
        created_at: payload.requested_at,
        updated_at: now_ms(),
        transactions: None,
        error: None,
    };
    state.store.settlements.put_status(&status).await?;

    if !config.settlement_execute {
        status.state = SettlementState::DryRun;
        status.updated_at = now_ms();
        state.store.settlements.put_status(&status).await?;
        state
            .store
            .settlements
            .push_history(&status, config.rebalance_history_limit)
            .await?;
        info!(
            "settlement dry-run for {} over {} assets",
            &payload.address,
            payload.plan.len()
        );
        return Ok(status);
    }

    let mut transactions: Vec<String> = Vec::new();
    for item in &payload.plan {
        if item.amount_minor_units == U256::ZERO {
            info!(
                "settlement for {}: skipping zero-amount {}",
                &payload.address, &item.asset_id
            );
            continue;
        }
        handle.heartbeat().await?;
        let sent = transfer_item(state, item, claimant).await;
        handle.heartbeat().await?;
        match sent {
            Ok(hash) => {
                info!(
                    "settlement transfer {} {} -> {}: {}",
                    item.amount_formatted, &item.symbol, &payload.address,
                    &hash
                );
                transactions.push(hash);
            },
            Err(error) => {
                warn!(
                    "settlement transfer of {} failed for {}: {}",
                    &item.asset_id, &payload.address, error
                );
                status.state = SettlementState::Failed;
                status.updated_at = now_ms();
                status.error = Some(error.to_string());
                status.transactions = Some(transactions);
                state.store.settlements.put_status(&status).await?;
                state
                    .store
                    .settlements
                    .push_history(&status, config.rebalance_history_limit)
                    .await?;
                return Err(Error::SettlementTransfer(error.to_string()));
            },
        }
    }

    state
        .store
        .deposits
        .mark_user_settled(&payload.address)
        .await?;
    state
        .store
        .votes
        .remove_vote(
            &config.proposal_id,
            &payload.address,
            &state.store.deposits,
        )
        .await?;
    state
        .store
        .queue
        .enqueue(
            JobKind::Rebalance,
            JobPayload::Rebalance(RebalancePayload {
                reason: RebalanceReason::Manual,
                context: Some(serde_json::json!({
                    "triggeredBy": "settlement",
                    "address": payload.address,
                })),
            }),
            None,
        )
        .await?;

    status.state = SettlementState::Executed;
    status.updated_at = now_ms();
    status.transactions = Some(transactions);
    state.store.settlements.put_status(&status).await?;
    state
        .store
        .settlements
        .push_history(&status, config.rebalance_history_limit)
        .await?;
    info!("settlement executed for {}", &payload.address);
    Ok(status)
}

async fn transfer_item(
    state: &AppState<State>,
    item: &AssetTransferPlan,
    claimant: Address,
) -> Result<String, Error> {
    match item.kind {
        AssetKind::Native => {
            let receipt = state
                .evm
                .send_transaction(TxRequest {
                    to: claimant,
                    value: item.amount_minor_units,
                    data: None,
                })
                .await?;
            Ok(receipt.transaction_hash)
        },
        AssetKind::Token => {
            let token = item
                .token_address
                .as_deref()
                .ok_or_else(|| {
                    Error::ConfigurationError(format!(
                        "token asset {} has no address",
                        &item.asset_id
                    ))
                })
                .and_then(parse_address)?;
            let receipt = state
                .evm
                .erc20_transfer(token, claimant, item.amount_minor_units)
                .await?;
            Ok(receipt.transaction_hash)
        },
    }
}
