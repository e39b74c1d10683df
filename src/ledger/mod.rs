//! Durable idempotency ledger: one row per attempted issue plus a record of
//! actioned reviewer comments.

pub mod db;
pub mod models;

pub use db::{LedgerDb, LedgerHandle};
pub use models::*;
