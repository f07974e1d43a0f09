use actix_web::{get, web, Responder};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[get("/version")]
pub async fn index() -> Result<impl Responder, Error> {
    const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

    Ok(web::Json(Response {
        version: VERSION.map(|v| v.to_string()),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub version: Option<String>,
}
