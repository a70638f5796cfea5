//! Export coordinator
//!
//! Moves funds out of the bank. Submitting an export debits the user and
//! appends the export to the outbox in one RocksDB transaction, so either
//! both happen or neither does. Consuming exports reads the outbox through
//! the configured consumer group and hands each export to the caller with
//! ack/nack capabilities attached.
//!
//! Exports are delivered at least once. Whatever the caller does with an
//! [`ExportInProgress`] must be idempotent.

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    outbox::{OutboxLog, RecordHandle},
    storage::Storage,
    types::{Export, ExportId},
    Config,
};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Submits exports and streams them to workers
#[derive(Clone)]
pub struct ExportCoordinator {
    storage: Arc<Storage>,
    outbox: Arc<OutboxLog>,
    metrics: Metrics,
    group: String,
    consumer: String,
    block_timeout: Duration,
}

impl ExportCoordinator {
    pub(crate) fn new(
        storage: Arc<Storage>,
        outbox: Arc<OutboxLog>,
        metrics: Metrics,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            outbox,
            metrics,
            group: config.outbox.consumer_group.clone(),
            consumer: config.outbox.consumer_name.clone(),
            block_timeout: config.outbox.block_timeout(),
        }
    }

    /// Use a different consumer name, e.g. one per worker task
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Debit `export.from_user_id` by `export.amount` and enqueue the export.
    ///
    /// Fails with [`Error::InvalidAmount`] for a non-positive amount and with
    /// [`Error::InsufficientFunds`] if the balance is too low. In both cases
    /// nothing is written.
    pub fn submit_export(&self, export: Export) -> Result<ExportId> {
        let span = export.span();
        let _enter = span.enter();

        if export.amount <= 0 {
            return Err(Error::InvalidAmount(export.amount));
        }

        let payload = serde_json::to_vec(&export)?;
        let debit = export.amount.saturating_neg();

        let id = self.storage.with_txn(
            || {
                format!(
                    "submit_export user={} amount={} protocol={}",
                    export.from_user_id, export.amount, export.protocol
                )
            },
            |txn| {
                self.storage.increment_in(txn, &export.from_user_id, debit)?;
                self.outbox.append_in(txn, &payload)
            },
        );

        let id = match id {
            Ok(id) => id,
            Err(e) => {
                if e.is_insufficient_funds() {
                    self.metrics.insufficient_funds_total.inc();
                }
                return Err(e);
            }
        };

        self.outbox.notify_appended();
        self.metrics.exports_submitted.inc();
        span.record("export_id", tracing::field::display(id));
        tracing::info!("Export submitted");
        Ok(id)
    }

    /// Read exports from the consumer group and send them to `out`.
    ///
    /// Runs until `cancel` fires ([`Error::Canceled`]), `out` is closed
    /// ([`Error::Concurrency`]), or reading fails. It never returns `Ok` and
    /// never closes `out`. Blocks while `out` is full, so the receiver must
    /// keep draining it.
    ///
    /// Several calls may run at once; they split the exports between them.
    pub async fn consume_exports(
        &self,
        cancel: &CancellationToken,
        out: &mpsc::Sender<ExportInProgress>,
    ) -> Result<Infallible> {
        let mut delivered = 0;
        self.consume(cancel, out, &mut delivered).await
    }

    /// Body of [`ExportCoordinator::consume_exports`], counting the exports
    /// handed to `out` in `delivered`
    async fn consume(
        &self,
        cancel: &CancellationToken,
        out: &mpsc::Sender<ExportInProgress>,
        delivered: &mut u64,
    ) -> Result<Infallible> {
        let mut reader = self.outbox.open_reader(&self.group, &self.consumer)?;

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                next = reader.next(self.block_timeout) => next?,
            };
            let Some(record) = record else {
                continue;
            };

            let delivery_count = record.delivery_count;
            let (id, payload, handle) = record.into_parts();

            let export: Export = match serde_json::from_slice(&payload) {
                Ok(export) => export,
                Err(e) => {
                    tracing::error!(export_id = %id, error = %e, "Undecodable export in outbox");
                    handle.nack();
                    return Err(e.into());
                }
            };

            let in_progress = ExportInProgress {
                id,
                export,
                delivery_count,
                handle,
            };

            if cancel.is_cancelled() {
                in_progress.nack();
                return Err(Error::Canceled);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    in_progress.nack();
                    return Err(Error::Canceled);
                }
                permit = out.reserve() => match permit {
                    Ok(permit) => {
                        tracing::debug!(export_id = %id, delivery_count, "Export handed to worker");
                        permit.send(in_progress);
                        *delivered += 1;
                    }
                    Err(_) => {
                        in_progress.nack();
                        return Err(Error::Concurrency("export channel closed".into()));
                    }
                },
            }
        }
    }

    /// Keep [`ExportCoordinator::consume_exports`] running, restarting it
    /// with exponential backoff after failures. Returns once `cancel` fires
    /// or `out` is closed.
    pub async fn run_consumer(&self, cancel: &CancellationToken, out: &mpsc::Sender<ExportInProgress>) {
        let mut backoff = consumer_backoff();

        tracing::info!(group = %self.group, consumer = %self.consumer, "Export consumer starting");

        loop {
            let mut delivered = 0;
            let err = match self.consume(cancel, out, &mut delivered).await {
                Ok(never) => match never {},
                Err(e) => e,
            };

            if matches!(err, Error::Canceled) {
                break;
            }
            if out.is_closed() {
                tracing::info!(group = %self.group, "Export channel closed");
                break;
            }

            let delay = restart_delay(&mut backoff, delivered > 0);
            tracing::error!(
                group = %self.group,
                consumer = %self.consumer,
                error = %err,
                delivered,
                retry_in_ms = delay.as_millis() as u64,
                "Export consumer failed, restarting"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(group = %self.group, consumer = %self.consumer, "Export consumer stopped");
    }

    /// Underlying outbox
    pub fn outbox(&self) -> &Arc<OutboxLog> {
        &self.outbox
    }
}

const MAX_RESTART_DELAY: Duration = Duration::from_secs(10);

fn consumer_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(MAX_RESTART_DELAY)
        .with_max_elapsed_time(None)
        .build()
}

/// Delay before the next consumer restart. A run that delivered anything
/// counts as healthy, so the backoff starts over.
fn restart_delay(backoff: &mut ExponentialBackoff, made_progress: bool) -> Duration {
    if made_progress {
        backoff.reset();
    }
    backoff.next_backoff().unwrap_or(MAX_RESTART_DELAY)
}

impl std::fmt::Debug for ExportCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportCoordinator")
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("block_timeout", &self.block_timeout)
            .finish()
    }
}

/// An export delivered to a worker, together with the means to settle it.
///
/// Call [`ExportInProgress::ack`] once the export has been carried out, or
/// [`ExportInProgress::nack`] to have it retried. Dropping it without
/// either leaves it pending until the delivering reader goes away or the
/// claim idle time passes, after which it is redelivered.
#[derive(Debug)]
pub struct ExportInProgress {
    /// Outbox id of the export
    pub id: ExportId,

    /// The export itself
    pub export: Export,

    /// 1 on first delivery
    pub delivery_count: u32,

    handle: RecordHandle,
}

impl ExportInProgress {
    /// Mark the export done. Safe to call more than once.
    pub fn ack(&self) -> Result<()> {
        self.handle.ack()
    }

    /// Return the export for another attempt
    pub fn nack(&self) {
        self.handle.nack()
    }

    /// Handle that can settle this export after it has been moved elsewhere
    pub fn handle(&self) -> RecordHandle {
        self.handle.clone()
    }

    /// Span annotated with the export's fields and id
    pub fn span(&self) -> tracing::Span {
        let span = self.export.span();
        span.record("export_id", tracing::field::display(self.id));
        span
    }
}
