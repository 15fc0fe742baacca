//! Database module for device history.
//!
//! Provides SQLite storage with an embedded schema.

mod models;
mod store;

pub use models::*;
pub use store::*;
