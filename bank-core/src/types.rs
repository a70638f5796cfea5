//! Core types for the bank
//!
//! Balances are whole units of the in-system currency, so amounts are plain
//! signed integers. Export records are JSON on disk; outbox bookkeeping is
//! bincode.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Amount of the in-system currency
pub type Amount = i64;

/// Opaque user identifier (chat-platform user ID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Position of an entry in the outbox log. Assigned on append, strictly
/// increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

/// Exports are identified by the outbox record they were appended as.
pub type ExportId = RecordId;

impl RecordId {
    /// Wrap a raw sequence number
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Raw sequence number
    pub fn seq(&self) -> u64 {
        self.0
    }

    /// Big-endian key, so RocksDB's byte order matches append order
    pub(crate) fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Everything needed to move funds from a user's account to some system
/// outside of the bank (e.g. a crypto chain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    /// User whose balance is debited
    pub from_user_id: UserId,

    /// Amount debited, always positive
    pub amount: Amount,

    /// The protocol the funds are being transferred to
    pub protocol: String,

    /// Whatever data the protocol needs to carry out the transfer (e.g. a
    /// signed but unsubmitted transaction). Opaque to the bank.
    pub protocol_payload: String,
}

impl Export {
    /// Create a new export request
    pub fn new(
        from_user_id: impl Into<UserId>,
        amount: Amount,
        protocol: impl Into<String>,
        protocol_payload: impl Into<String>,
    ) -> Self {
        Self {
            from_user_id: from_user_id.into(),
            amount,
            protocol: protocol.into(),
            protocol_payload: protocol_payload.into(),
        }
    }

    /// Span annotated with the export's fields. `export_id` is filled in
    /// once the export has been enqueued.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "export",
            export_id = tracing::field::Empty,
            export_from_user_id = %self.from_user_id,
            export_amount = self.amount,
            export_protocol = %self.protocol,
        )
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Delivery bookkeeping for one record within one consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingEntry {
    /// Consumer name of the current holder
    pub consumer: String,

    /// Reader session of the current holder
    pub session: Uuid,

    /// When the entry was last handed out (ms since Unix epoch)
    pub delivered_at_ms: i64,

    /// How many times the entry has been handed out
    pub delivery_count: u32,

    /// Set by nack: any reader may take the entry immediately
    pub released: bool,
}

/// Read-only view of a pending entry, for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    /// Record the entry refers to
    pub id: RecordId,

    /// Consumer that last received it
    pub consumer: String,

    /// Number of deliveries so far
    pub delivery_count: u32,

    /// Time since the last delivery
    pub idle: Duration,

    /// Whether the entry was nacked and is waiting for a reader
    pub released: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_key_order_matches_numeric_order() {
        let a = RecordId::new(9);
        let b = RecordId::new(256);
        assert!(a.to_key() < b.to_key());
        assert_eq!(RecordId::from_key(&b.to_key()), Some(b));
        assert_eq!(RecordId::from_key(&[1, 2, 3]), None);
    }

    #[test]
    fn test_record_id_display_roundtrip() {
        let id = RecordId::new(42);
        assert_eq!(id.to_string().parse::<RecordId>().unwrap(), id);
    }

    #[test]
    fn test_export_json_field_names() {
        let export = Export::new("U123", 5, "stellar", "AAAA");
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["from_user_id"], "U123");
        assert_eq!(json["amount"], 5);
        assert_eq!(json["protocol_payload"], "AAAA");
    }
}
