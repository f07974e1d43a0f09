mod asset;
mod quote;
mod requests;
mod spot_price;
mod treasury;

pub use asset::{Asset, AssetKind, NATIVE_TOKEN_SENTINEL};
pub use quote::{
    AllowanceIssue, QuoteIssues, QuoteParams, QuoteRoute, QuoteTransaction,
    RouteFill, SwapQuote,
};
pub use requests::{
    ClaimRequest, DepositWebhook, RebalanceTrigger, StatusResponse,
    VoteRequest,
};
pub use spot_price::SpotPriceResponse;
pub use treasury::{AssetBalance, TreasurySnapshot};
