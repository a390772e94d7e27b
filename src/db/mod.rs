//! Database module for Watchtower.
//!
//! Provides pooled Postgres storage with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
