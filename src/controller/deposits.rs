use actix_web::{get, web, HttpResponse, Result};
use serde::{Deserialize, Serialize};

use crate::{
    configuration::{AppState, State},
    error::Error,
    model::{DepositTransaction, UserStats},
};

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct Query {
    address: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub stats: Option<UserStats>,
    pub transactions: Vec<DepositTransaction>,
}

/// One depositor's totals and recent deposits, newest first.
#[get("/deposits")]
pub async fn index(
    state: web::Data<AppState<State>>,
    query: web::Query<Query>,
) -> Result<HttpResponse, Error> {
    let address = query.address.to_lowercase();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(100);

    let stats = state.store.deposits.get_user_stats(&address).await?;
    let transactions = state
        .store
        .deposits
        .list_transactions(&address, limit)
        .await?;

    Ok(HttpResponse::Ok().json(Response {
        stats,
        transactions,
    }))
}
