//! Persisted entities
//!
//! All key-value store record structs are consolidated in models.rs,
//! with store.rs kept separate for the typed accessor wrapper.

mod models;
mod store;

pub use models::*;
pub use store::Store;
