//! Main ledger orchestration layer
//!
//! This module ties together storage, the outbox and metrics into the
//! accounting API used by the rest of the bot.
//!
//! # Example
//!
//! ```no_run
//! use bank_core::{Config, Export, Ledger, UserId};
//!
//! fn main() -> bank_core::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let alice = UserId::new("U123");
//!
//!     ledger.incr(&alice, 10)?;
//!     ledger.transfer(&UserId::new("U456"), &alice, 3)?;
//!
//!     let export_id = ledger
//!         .exports()
//!         .submit_export(Export::new(alice, 5, "stellar", "AAAA..."))?;
//!     println!("queued export {}", export_id);
//!     Ok(())
//! }
//! ```

use crate::{
    export::ExportCoordinator,
    metrics::Metrics,
    outbox::OutboxLog,
    types::{Amount, UserId},
    Config, Result, Storage,
};
use std::sync::Arc;

/// Main ledger interface
pub struct Ledger {
    /// Balances, outbox and cursors
    storage: Arc<Storage>,

    /// Export queue
    outbox: Arc<OutboxLog>,

    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()?;
        let outbox = OutboxLog::new(storage.clone(), config.outbox.claim_idle(), metrics.clone());

        tracing::info!(
            service = %config.service_name,
            consumer_group = %config.outbox.consumer_group,
            consumer = %config.outbox.consumer_name,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            outbox,
            metrics,
            config,
        })
    }

    /// Current balance; 0 for users never seen
    pub fn balance(&self, user: &UserId) -> Result<Amount> {
        self.storage.balance(user)
    }

    /// Add `delta` (which may be negative) to the user's balance.
    ///
    /// Fails with [`crate::Error::InsufficientFunds`] and leaves the balance
    /// alone if it would go below zero.
    pub fn incr(&self, user: &UserId, delta: Amount) -> Result<Amount> {
        let result = self.storage.increment(user, delta);
        self.metrics.record_result(&self.metrics.increments_total, &result);
        result
    }

    /// Move `amount` from `src` to `dst`, returning the new (dst, src)
    /// balances. `amount` must be positive.
    pub fn transfer(&self, dst: &UserId, src: &UserId, amount: Amount) -> Result<(Amount, Amount)> {
        let result = self.storage.transfer(dst, src, amount);
        self.metrics.record_result(&self.metrics.transfers_total, &result);
        result
    }

    /// Last value stored under a named external cursor
    pub fn cursor(&self, name: &str) -> Result<Option<String>> {
        self.storage.cursor(name)
    }

    /// Overwrite a named external cursor
    pub fn set_cursor(&self, name: &str, value: &str) -> Result<()> {
        self.storage.set_cursor(name, value)
    }

    /// Credit an incoming payment and advance the named cursor past it, as
    /// one unit. Replaying the same cursor value credits nothing. Returns
    /// the balance and whether the credit was applied.
    pub fn deposit(
        &self,
        user: &UserId,
        amount: Amount,
        cursor_name: &str,
        cursor: &str,
    ) -> Result<(Amount, bool)> {
        let result = self.storage.deposit(user, amount, cursor_name, cursor);
        if let Ok((_, true)) = result {
            self.metrics.increments_total.inc();
        }
        result
    }

    /// Export coordinator using the configured consumer group
    pub fn exports(&self) -> ExportCoordinator {
        ExportCoordinator::new(
            self.storage.clone(),
            self.outbox.clone(),
            self.metrics.clone(),
            &self.config,
        )
    }

    /// Raw outbox, for introspection
    pub fn outbox(&self) -> &Arc<OutboxLog> {
        &self.outbox
    }

    /// Metrics for this ledger
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close the ledger. The database closes once every export coordinator
    /// and outstanding export handle is gone too.
    pub fn close(self) -> Result<()> {
        let Self {
            storage, outbox, ..
        } = self;
        drop(outbox);

        match Arc::try_unwrap(storage) {
            Ok(storage) => storage.close(),
            Err(_) => {
                tracing::info!("Ledger closed, storage still shared");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("outbox", &self.outbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use tempfile::TempDir;

    fn open_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Ledger::open(config).unwrap(), temp_dir)
    }

    #[test]
    fn test_incr_and_balance() {
        let (ledger, _temp) = open_ledger();
        let a = UserId::new("a");

        assert_eq!(ledger.balance(&a).unwrap(), 0);
        assert_eq!(ledger.incr(&a, 10).unwrap(), 10);
        assert!(ledger.incr(&a, -11).unwrap_err().is_insufficient_funds());
        assert_eq!(ledger.balance(&a).unwrap(), 10);

        assert_eq!(ledger.metrics().increments_total.get(), 1);
        assert_eq!(ledger.metrics().insufficient_funds_total.get(), 1);
    }

    #[test]
    fn test_transfer() {
        let (ledger, _temp) = open_ledger();
        let (a, b) = (UserId::new("a"), UserId::new("b"));
        ledger.incr(&a, 10).unwrap();

        assert_eq!(ledger.transfer(&b, &a, 3).unwrap(), (3, 7));
        assert!(ledger.transfer(&b, &a, 100).unwrap_err().is_insufficient_funds());
        assert!(matches!(ledger.transfer(&b, &a, -1), Err(Error::InvalidAmount(-1))));
        assert_eq!(ledger.balance(&a).unwrap(), 7);
        assert_eq!(ledger.balance(&b).unwrap(), 3);
        assert_eq!(ledger.metrics().transfers_total.get(), 1);
    }

    #[test]
    fn test_deposit_counts_only_applied_credits() {
        let (ledger, _temp) = open_ledger();
        let a = UserId::new("a");

        assert_eq!(ledger.deposit(&a, 5, "stellar", "t1").unwrap(), (5, true));
        assert_eq!(ledger.deposit(&a, 5, "stellar", "t1").unwrap(), (5, false));
        assert_eq!(ledger.cursor("stellar").unwrap().as_deref(), Some("t1"));
        assert_eq!(ledger.metrics().increments_total.get(), 1);
    }

    #[test]
    fn test_close_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let ledger = Ledger::open(config.clone()).unwrap();
        ledger.incr(&UserId::new("a"), 7).unwrap();
        ledger.set_cursor("stellar", "t9").unwrap();
        ledger.close().unwrap();

        let ledger = Ledger::open(config).unwrap();
        assert_eq!(ledger.balance(&UserId::new("a")).unwrap(), 7);
        assert_eq!(ledger.cursor("stellar").unwrap().as_deref(), Some("t9"));
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.outbox.consumer_group = String::new();
        assert!(matches!(Ledger::open(config), Err(Error::Config(_))));
    }
}
