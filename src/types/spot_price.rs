use serde::{Deserialize, Serialize};

/// Coinbase spot price response: `{ data: { amount: "2000.00", .. } }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpotPriceResponse {
    pub data: SpotPriceData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpotPriceData {
    pub amount: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}
