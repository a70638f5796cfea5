//! Buckaroo Bank Core
//!
//! Play-money balances for a chat bot, and an outbox of withdrawals to
//! external ledgers.
//!
//! # Architecture
//!
//! - **Pessimistic Transactions**: Every check-then-write runs under RocksDB row locks
//! - **Atomic Export**: Debit and enqueue commit in the same transaction
//! - **Consumer Groups**: Competing readers split the outbox between them
//! - **At-Least-Once**: Unacked exports are redelivered, so consumers must be idempotent
//!
//! # Invariants
//!
//! - No balance is ever observed below zero
//! - Money is only created by `incr`/`deposit` and only leaves through `incr` or exports
//! - A transfer or export is applied entirely or not at all
//! - An acked export is never redelivered to the same group

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod outbox;
pub mod ledger;
pub mod export;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{Amount, Export, ExportId, PendingInfo, RecordId, UserId};
pub use storage::Storage;
pub use outbox::{OutboxLog, Reader, Record, RecordHandle};
pub use ledger::Ledger;
pub use export::{ExportCoordinator, ExportInProgress};
pub use config::Config;
pub use metrics::Metrics;
