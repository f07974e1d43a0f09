mod evm;
mod http;
mod kv;
mod store;

pub use evm::{
    connect, AlloyEvm, BlockInfo, EvmClient, ReceiptInfo, TxInfo, TxRequest,
};
pub use http::{PriceSource, QuoteSource, HTTP};
pub use kv::{
    pattern_matches, KvCommand, KvDriver, KvHandle, KvValue, MemoryKv,
    SetOptions,
};
pub use store::StorePool;

#[cfg(test)]
pub use evm::testing;
