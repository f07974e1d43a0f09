use actix_web::{post, web, HttpResponse, Result};
use serde::Serialize;

use crate::{
    configuration::{AppState, State},
    dao::LockOperation,
    error::Error,
    helpers::{address_lower, now_ms},
    model::{
        DepositTransaction, JobKind, JobPayload, RebalancePayload,
        RebalanceReason, UserStats,
    },
    types::DepositWebhook,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub recorded: bool,
    pub stats: Option<UserStats>,
}

/// Deposit webhook: the transaction is re-read from the chain and must
/// be a confirmed transfer of the exact required value to the vault.
#[post("/deposit")]
pub async fn index(
    state: web::Data<AppState<State>>,
    body: web::Json<DepositWebhook>,
) -> Result<HttpResponse, Error> {
    let hash = body.hash.trim().to_lowercase();
    if !hash.starts_with("0x") || hash.len() != 66 {
        return Err(Error::TransactionNotFound(body.hash.to_owned()));
    }

    let lock = state
        .store
        .locks
        .acquire(
            LockOperation::Transaction,
            Some(&hash),
            state.config.request_lock_ttl,
        )
        .await?;
    if !lock.acquired {
        return Err(Error::AlreadyInProgress);
    }

    let result = validate_and_record(&state, &hash).await;
    lock.release().await?;
    let (recorded, from) = result?;

    let stats = state.store.deposits.get_user_stats(&from).await?;
    Ok(HttpResponse::Ok().json(Response { recorded, stats }))
}

async fn validate_and_record(
    state: &AppState<State>,
    hash: &str,
) -> Result<(bool, String), Error> {
    let config = &state.config;

    let tx = state
        .evm
        .get_transaction(hash)
        .await?
        .ok_or_else(|| Error::TransactionNotFound(hash.to_string()))?;
    let receipt = state
        .evm
        .get_transaction_receipt(hash)
        .await?
        .ok_or_else(|| {
            Error::NotConfirmed(String::from("no receipt yet"))
        })?;

    if !receipt.status {
        return Err(Error::NotConfirmed(String::from(
            "transaction reverted",
        )));
    }
    if tx.chain_id.unwrap_or(config.chain_id) != config.chain_id {
        return Err(Error::ChainMismatch);
    }
    match tx.to {
        Some(to) if to == config.vault_address => {},
        _ => return Err(Error::RecipientMismatch),
    }
    if tx.value != config.required_deposit_minor_units {
        return Err(Error::DepositValueMismatch);
    }

    let block_number = receipt
        .block_number
        .or(tx.block_number)
        .ok_or_else(|| Error::NotConfirmed(String::from("still pending")))?;
    let head = state.evm.block_number().await?;
    let confirmations = head.saturating_sub(block_number) + 1;
    if confirmations < config.required_confirmations {
        return Err(Error::NotConfirmed(format!(
            "{} of {} confirmations",
            confirmations, config.required_confirmations
        )));
    }

    let from = address_lower(&tx.from);
    let record = DepositTransaction {
        hash: hash.to_string(),
        from: from.clone(),
        to: address_lower(&config.vault_address),
        value_minor_units: tx.value,
        block_number,
        block_hash: tx.block_hash.unwrap_or_default(),
        timestamp: now_ms(),
        chain_id: config.chain_id,
        confirmations,
    };

    let recorded = state.store.deposits.record_deposit(&record).await?;
    if recorded {
        state
            .store
            .queue
            .enqueue(
                JobKind::Rebalance,
                JobPayload::Rebalance(RebalancePayload {
                    reason: RebalanceReason::Deposit,
                    context: None,
                }),
                None,
            )
            .await?;
    }
    Ok((recorded, from))
}
