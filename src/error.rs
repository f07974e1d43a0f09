use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use anyhow::Error as ANYHOW_ERROR;
use bigdecimal::ParseBigDecimalError as BIG_DECIMAL_ERROR;
use serde_json::Error as JSON_ERROR;
use std::num::{ParseFloatError, ParseIntError, TryFromIntError};
use std::{env::VarError, io::Error as IO_ERROR};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::subscriber::SetGlobalDefaultError as TRACING_GLOBAL_DEFAULT_ERROR;
use url::ParseError as URL_ERROR;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] IO_ERROR),

    #[error("{0}")]
    URL(#[from] URL_ERROR),

    #[error("{0}")]
    INT(#[from] ParseIntError),

    #[error("{0}")]
    FLOAT(#[from] ParseFloatError),

    #[error("{0}")]
    VAR(#[from] VarError),

    #[error("{0}")]
    TokioJoinError(#[from] JoinError),

    #[error("{0}")]
    JsonError(#[from] JSON_ERROR),

    #[error("{0}")]
    BigDecimalError(#[from] BIG_DECIMAL_ERROR),

    #[error("{0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("{0}")]
    TryFromIntError(#[from] TryFromIntError),

    #[error("Tracing error: {0}")]
    SetGlobalDefaultError(#[from] TRACING_GLOBAL_DEFAULT_ERROR),

    #[error("{0}")]
    AnyHowError(#[from] ANYHOW_ERROR),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Key-value store error: {0}")]
    Kv(String),

    #[error("EVM client error: {0}")]
    Evm(String),

    #[error("Aggregator returned {status}: {body}")]
    Aggregator { status: u16, body: String },

    #[error("Price unavailable for asset: {0}")]
    PriceUnavailable(String),

    #[error("Price snapshots use mixed decimal scales")]
    PriceScaleMismatch,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid percent: {0}")]
    InvalidPercent(i64),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature does not match address")]
    SignatureMismatch,

    #[error("Signed message expired")]
    SignatureExpired,

    #[error("Address has no recorded deposit")]
    NotADepositor,

    #[error("Nothing to claim")]
    NothingToClaim,

    #[error("Transaction chain id does not match the configured chain")]
    ChainMismatch,

    #[error("Transaction recipient is not the vault")]
    RecipientMismatch,

    #[error("Deposit value does not match the required amount")]
    DepositValueMismatch,

    #[error("Transaction not confirmed: {0}")]
    NotConfirmed(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Operation already in progress")]
    AlreadyInProgress,

    #[error("Asset not configured: {0}")]
    UnknownAsset(String),

    #[error("Vault signing key is not configured")]
    VaultKeyMissing,

    #[error("Numeric overflow: {0}")]
    Numeric(String),

    #[error("Invalid job payload: {0}")]
    JobPayload(String),

    #[error("Settlement transfer failed: {0}")]
    SettlementTransfer(String),

    #[error("Server end with error: {0}")]
    ServerError(String),

    #[error("Task error: {0}")]
    TaskError(String),
}

impl Error {
    /// Whether a failed background job should be requeued for another
    /// attempt. Permanent failures (bad payloads, reverted transfers,
    /// aggregator rejections) are not retried; the user re-triggers.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kv(_)
            | Error::Evm(_)
            | Error::ReqwestError(_)
            | Error::PriceUnavailable(_)
            | Error::TokioJoinError(_)
            | Error::Io(_) => true,
            Error::Aggregator { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - client sent invalid input
            Error::InvalidAddress(_)
            | Error::InvalidPercent(_)
            | Error::InvalidSignature(_)
            | Error::ChainMismatch
            | Error::RecipientMismatch
            | Error::DepositValueMismatch
            | Error::NotConfirmed(_)
            | Error::TransactionNotFound(_)
            | Error::NothingToClaim
            | Error::JobPayload(_)
            | Error::INT(_)
            | Error::FLOAT(_)
            | Error::BigDecimalError(_)
            | Error::JsonError(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized - signature problems
            Error::SignatureMismatch | Error::SignatureExpired => {
                StatusCode::UNAUTHORIZED
            },

            // 403 Forbidden - policy rejections
            Error::NotADepositor => StatusCode::FORBIDDEN,

            // 404 Not Found
            Error::UnknownAsset(_) => StatusCode::NOT_FOUND,

            // 429 Too Many Requests - a lock is held elsewhere
            Error::AlreadyInProgress => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway - upstream service error
            Error::ReqwestError(_)
            | Error::Aggregator { .. }
            | Error::Evm(_)
            | Error::PriceUnavailable(_)
            | Error::PriceScaleMismatch => StatusCode::BAD_GATEWAY,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Unknown"),
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        HttpResponse::build(status).json(body)
    }
}
