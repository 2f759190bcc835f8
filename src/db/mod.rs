//! Call-record store.
//!
//! SQLite through `sqlx`. The schema is a single `call_history` table,
//! created on connect. The store knows nothing about signaling sessions.

pub mod models;
pub mod operations;

pub use models::{AttachOutcome, CallRecord};
pub use operations::DbOperations;
