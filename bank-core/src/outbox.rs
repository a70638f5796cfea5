//! Outbox log with consumer groups
//!
//! An append-only, totally ordered log stored in the `exports` column
//! family. Readers consume it through named consumer groups. Readers in
//! the same group compete, so each entry is handed to one reader at a
//! time. Delivery is at-least-once:
//!
//! - an entry stays pending for its group until it is acked
//! - a nacked entry can be taken again by any reader immediately
//! - an entry whose reader session has ended (reader and all of its
//!   record handles dropped, or the process restarted) can be taken again
//!   immediately
//! - an entry held longer than `claim_idle` can be claimed by another reader
//!
//! ```text
//!   append ──► exports: 1 2 3 4 5 6 ...
//!                           ▲
//!                     group cursor (last entry handed out)
//!
//!   pending[group]: {2: reader-a, 3: released}   ──► ack deletes the entry
//! ```

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    storage::{Storage, Txn, CF_EXPORTS, CF_GROUPS, CF_META, CF_PENDING},
    types::{PendingEntry, PendingInfo, RecordId},
};
use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const SEQ_KEY: &[u8] = b"outbox/seq";

/// Durable ordered queue with consumer groups
pub struct OutboxLog {
    storage: Arc<Storage>,

    /// Woken on append, nack and reader shutdown
    notify: Notify,

    /// Reader sessions alive in this process
    sessions: Mutex<HashSet<Uuid>>,

    claim_idle: Duration,

    metrics: Metrics,
}

impl OutboxLog {
    /// Create the log on top of an open storage
    pub fn new(storage: Arc<Storage>, claim_idle: Duration, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            storage,
            notify: Notify::new(),
            sessions: Mutex::new(HashSet::new()),
            claim_idle,
            metrics,
        })
    }

    /// Append a payload to the end of the log
    pub fn append(&self, payload: &[u8]) -> Result<RecordId> {
        let id = self.storage.with_txn(
            || format!("outbox append len={}", payload.len()),
            |txn| self.append_in(txn, payload),
        )?;
        self.notify_appended();
        Ok(id)
    }

    /// Append inside a caller's transaction. The caller must call
    /// [`OutboxLog::notify_appended`] after committing.
    pub(crate) fn append_in(&self, txn: &Txn<'_>, payload: &[u8]) -> Result<RecordId> {
        let cf_meta = self.storage.cf_handle(CF_META)?;
        let cf_exports = self.storage.cf_handle(CF_EXPORTS)?;

        // Locking the sequence serializes appends, so a record is committed
        // before the next id is handed out
        let last: u64 = match txn.get_for_update_cf(cf_meta, SEQ_KEY, true)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => 0,
        };
        let id = RecordId::new(last + 1);

        txn.put_cf(cf_meta, SEQ_KEY, bincode::serialize(&id.seq())?)?;
        txn.put_cf(cf_exports, id.to_key(), payload)?;

        tracing::debug!(record_id = %id, len = payload.len(), "Outbox entry appended");
        Ok(id)
    }

    /// Wake readers blocked in [`Reader::next`]
    pub(crate) fn notify_appended(&self) {
        self.notify.notify_waiters();
    }

    /// Open a reader in `group`. Readers sharing a group split its entries.
    pub fn open_reader(self: &Arc<Self>, group: &str, consumer: &str) -> Result<Reader> {
        if group.is_empty() || group.contains('\0') {
            return Err(Error::Config(format!("invalid consumer group name {:?}", group)));
        }

        let session = Session {
            id: Uuid::new_v4(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            log: Arc::clone(self),
        };
        self.sessions.lock().insert(session.id);

        tracing::debug!(group, consumer, session = %session.id, "Outbox reader opened");
        Ok(Reader {
            session: Arc::new(session),
        })
    }

    /// Id of the most recently appended entry
    pub fn last_id(&self) -> Result<Option<RecordId>> {
        let cf_meta = self.storage.cf_handle(CF_META)?;
        match self.storage.db().get_cf(cf_meta, SEQ_KEY)? {
            Some(bytes) => Ok(Some(RecordId::new(bincode::deserialize(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Number of entries ever appended. Entries are never removed from the
    /// log; acking only clears a group's pending state.
    pub fn len(&self) -> Result<u64> {
        Ok(self.last_id()?.map_or(0, |id| id.seq()))
    }

    /// Whether nothing was ever appended
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Payload of an entry, if it exists
    pub fn get(&self, id: RecordId) -> Result<Option<Vec<u8>>> {
        let cf_exports = self.storage.cf_handle(CF_EXPORTS)?;
        Ok(self.storage.db().get_cf(cf_exports, id.to_key())?)
    }

    /// Entries delivered to `group` and not yet acked, oldest first
    pub fn pending(&self, group: &str) -> Result<Vec<PendingInfo>> {
        let cf_pending = self.storage.cf_handle(CF_PENDING)?;
        let prefix = pending_prefix(group);
        let now_ms = Utc::now().timestamp_millis();

        let mut pending = Vec::new();
        let iter = self
            .storage
            .db()
            .iterator_cf(cf_pending, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(id) = RecordId::from_key(&key[prefix.len()..]) else {
                continue;
            };
            let entry: PendingEntry = bincode::deserialize(&value)?;
            pending.push(PendingInfo {
                id,
                consumer: entry.consumer,
                delivery_count: entry.delivery_count,
                idle: Duration::from_millis(now_ms.saturating_sub(entry.delivered_at_ms).max(0) as u64),
                released: entry.released,
            });
        }

        Ok(pending)
    }

    fn is_claimable(&self, entry: &PendingEntry, now_ms: i64) -> bool {
        entry.released
            || !self.sessions.lock().contains(&entry.session)
            || now_ms.saturating_sub(entry.delivered_at_ms) >= claim_idle_ms(self.claim_idle)
    }

    /// Hand the next entry to `session`: a re-deliverable pending entry if
    /// there is one, otherwise the first entry past the group cursor.
    fn claim_next(&self, session: &Session) -> Result<Option<Claimed>> {
        let cf_groups = self.storage.cf_handle(CF_GROUPS)?;
        let cf_pending = self.storage.cf_handle(CF_PENDING)?;
        let cf_exports = self.storage.cf_handle(CF_EXPORTS)?;
        let group = session.group.as_str();

        self.storage.with_txn(
            || format!("outbox claim group={} consumer={}", group, session.consumer),
            |txn| {
                let now_ms = Utc::now().timestamp_millis();

                // The cursor lock serializes claims within the group
                let cursor: u64 = match txn.get_for_update_cf(cf_groups, group.as_bytes(), true)? {
                    Some(bytes) => bincode::deserialize(&bytes)?,
                    None => 0,
                };

                let prefix = pending_prefix(group);
                let mut candidate = None;
                for item in txn.iterator_cf(
                    cf_pending,
                    IteratorMode::From(prefix.as_slice(), Direction::Forward),
                ) {
                    let (key, value) = item?;
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    let entry: PendingEntry = bincode::deserialize(&value)?;
                    if self.is_claimable(&entry, now_ms) {
                        if let Some(id) = RecordId::from_key(&key[prefix.len()..]) {
                            candidate = Some((id, key.to_vec()));
                            break;
                        }
                    }
                }

                if let Some((id, key)) = candidate {
                    // Re-read under lock; an ack may have removed it since the scan
                    if let Some(bytes) = txn.get_for_update_cf(cf_pending, &key, true)? {
                        let mut entry: PendingEntry = bincode::deserialize(&bytes)?;
                        if self.is_claimable(&entry, now_ms) {
                            match txn.get_cf(cf_exports, id.to_key())? {
                                Some(payload) => {
                                    let previous_consumer = std::mem::replace(
                                        &mut entry.consumer,
                                        session.consumer.clone(),
                                    );
                                    entry.session = session.id;
                                    entry.delivered_at_ms = now_ms;
                                    entry.delivery_count += 1;
                                    entry.released = false;
                                    txn.put_cf(cf_pending, &key, bincode::serialize(&entry)?)?;

                                    tracing::warn!(
                                        record_id = %id,
                                        group,
                                        consumer = %session.consumer,
                                        previous_consumer = %previous_consumer,
                                        delivery_count = entry.delivery_count,
                                        "Redelivering outbox entry"
                                    );
                                    return Ok(Some(Claimed {
                                        id,
                                        payload,
                                        delivery_count: entry.delivery_count,
                                    }));
                                }
                                None => {
                                    tracing::warn!(record_id = %id, group, "Dropping pending entry with no record");
                                    txn.delete_cf(cf_pending, &key)?;
                                }
                            }
                        }
                    }
                }

                let start = RecordId::new(cursor + 1).to_key();
                let next = txn
                    .iterator_cf(cf_exports, IteratorMode::From(&start, Direction::Forward))
                    .next()
                    .transpose()?;

                let Some((key, payload)) = next else {
                    return Ok(None);
                };
                let id = RecordId::from_key(&key)
                    .ok_or_else(|| Error::Config(format!("malformed outbox key {:?}", key)))?;

                let entry = PendingEntry {
                    consumer: session.consumer.clone(),
                    session: session.id,
                    delivered_at_ms: now_ms,
                    delivery_count: 1,
                    released: false,
                };
                txn.put_cf(cf_groups, group.as_bytes(), bincode::serialize(&id.seq())?)?;
                txn.put_cf(cf_pending, pending_key(group, id), bincode::serialize(&entry)?)?;

                Ok(Some(Claimed {
                    id,
                    payload: payload.into_vec(),
                    delivery_count: 1,
                }))
            },
        )
    }

    fn ack(&self, group: &str, id: RecordId) -> Result<()> {
        let cf_pending = self.storage.cf_handle(CF_PENDING)?;
        let key = pending_key(group, id);

        let removed = self.storage.with_txn(
            || format!("outbox ack group={} record_id={}", group, id),
            |txn| {
                if txn.get_for_update_cf(cf_pending, &key, true)?.is_none() {
                    return Ok(false);
                }
                txn.delete_cf(cf_pending, &key)?;
                Ok(true)
            },
        )?;

        if removed {
            self.metrics.exports_acked.inc();
            tracing::debug!(record_id = %id, group, "Outbox entry acked");
        } else {
            tracing::debug!(record_id = %id, group, "Outbox entry already acked");
        }
        Ok(())
    }

    fn nack(&self, group: &str, id: RecordId, session: Uuid) {
        let key = pending_key(group, id);
        let result = self.storage.cf_handle(CF_PENDING).and_then(|cf_pending| {
            self.storage.with_txn(
                || format!("outbox nack group={} record_id={}", group, id),
                |txn| {
                    let Some(bytes) = txn.get_for_update_cf(cf_pending, &key, true)? else {
                        return Ok(false);
                    };
                    let mut entry: PendingEntry = bincode::deserialize(&bytes)?;
                    // Someone else holds it now, or it was already released
                    if entry.session != session || entry.released {
                        return Ok(false);
                    }
                    entry.released = true;
                    txn.put_cf(cf_pending, &key, bincode::serialize(&entry)?)?;
                    Ok(true)
                },
            )
        });

        match result {
            Ok(true) => {
                self.metrics.exports_nacked.inc();
                tracing::warn!(record_id = %id, group, "Outbox entry released for redelivery");
                self.notify.notify_waiters();
            }
            Ok(false) => {
                tracing::debug!(record_id = %id, group, "Nack ignored, entry no longer held");
            }
            Err(e) => {
                // Still redelivered once the session ends or claim_idle passes
                tracing::warn!(record_id = %id, group, error = %e, "Failed to release outbox entry");
            }
        }
    }
}

impl std::fmt::Debug for OutboxLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxLog")
            .field("claim_idle", &self.claim_idle)
            .field("live_sessions", &self.sessions.lock().len())
            .finish()
    }
}

struct Claimed {
    id: RecordId,
    payload: Vec<u8>,
    delivery_count: u32,
}

/// One reader's lifetime within a group. Shared by the reader and every
/// record it delivered; when the last of them is dropped the session ends
/// and whatever it still holds becomes claimable.
struct Session {
    id: Uuid,
    group: String,
    consumer: String,
    log: Arc<OutboxLog>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.log.sessions.lock().remove(&self.id);
        self.log.notify.notify_waiters();
        tracing::debug!(group = %self.group, consumer = %self.consumer, session = %self.id, "Outbox reader session ended");
    }
}

/// Handle for reading a consumer group
pub struct Reader {
    session: Arc<Session>,
}

impl Reader {
    /// Consumer group this reader belongs to
    pub fn group(&self) -> &str {
        &self.session.group
    }

    /// Consumer name this reader delivers as
    pub fn consumer(&self) -> &str {
        &self.session.consumer
    }

    /// Wait up to `timeout` for the next entry. Returns `Ok(None)` on timeout.
    /// A timeout too large to represent as a deadline waits indefinitely.
    pub async fn next(&mut self, timeout: Duration) -> Result<Option<Record>> {
        let log = &self.session.log;
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            // Register for wakeups before looking, so an append between the
            // look and the wait is not missed
            let notified = log.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = log.claim_next(&self.session)? {
                if claimed.delivery_count > 1 {
                    log.metrics.exports_redelivered.inc();
                }
                return Ok(Some(Record {
                    id: claimed.id,
                    payload: claimed.payload,
                    delivery_count: claimed.delivery_count,
                    handle: RecordHandle {
                        session: Arc::clone(&self.session),
                        id: claimed.id,
                    },
                }));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("group", &self.session.group)
            .field("consumer", &self.session.consumer)
            .field("session", &self.session.id)
            .finish()
    }
}

/// An entry delivered to a reader
#[derive(Debug)]
pub struct Record {
    /// Position in the log
    pub id: RecordId,

    /// Raw payload as appended
    pub payload: Vec<u8>,

    /// 1 on first delivery, higher on redelivery
    pub delivery_count: u32,

    handle: RecordHandle,
}

impl Record {
    /// Split into the id, payload and ack/nack handle
    pub fn into_parts(self) -> (RecordId, Vec<u8>, RecordHandle) {
        (self.id, self.payload, self.handle)
    }

    /// Mark the entry processed for this group. Acking twice is fine.
    pub fn ack(&self) -> Result<()> {
        self.handle.ack()
    }

    /// Release the entry for redelivery
    pub fn nack(&self) {
        self.handle.nack()
    }
}

/// Acknowledge or release one delivered entry.
///
/// Carries only the group, the delivering session and the record id, so it
/// stays usable after the reader that produced it is gone.
#[derive(Clone)]
pub struct RecordHandle {
    session: Arc<Session>,
    id: RecordId,
}

impl RecordHandle {
    /// Record this handle refers to
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Consumer group the record was delivered in
    pub fn group(&self) -> &str {
        &self.session.group
    }

    /// Mark the entry processed for this group. Idempotent.
    pub fn ack(&self) -> Result<()> {
        self.session.log.ack(&self.session.group, self.id)
    }

    /// Release the entry for redelivery to any reader in the group. Never
    /// fails from the caller's point of view; errors are logged.
    pub fn nack(&self) {
        self.session
            .log
            .nack(&self.session.group, self.id, self.session.id)
    }
}

impl std::fmt::Debug for RecordHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordHandle")
            .field("group", &self.session.group)
            .field("consumer", &self.session.consumer)
            .field("id", &self.id)
            .finish()
    }
}

/// Saturates, so an out-of-range threshold means "never idle"
fn claim_idle_ms(claim_idle: Duration) -> i64 {
    i64::try_from(claim_idle.as_millis()).unwrap_or(i64::MAX)
}

fn pending_prefix(group: &str) -> Vec<u8> {
    let mut key = group.as_bytes().to_vec();
    key.push(0);
    key
}

fn pending_key(group: &str, id: RecordId) -> Vec<u8> {
    let mut key = pending_prefix(group);
    key.extend_from_slice(&id.to_key());
    key
}
