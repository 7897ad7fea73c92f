//! Change events pushed to subscribers and the row changes they are built from.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sent to a subscriber once its stream is open.
pub const CONNECTED_MESSAGE: &str = "Connection established";

/// Kind of message carried on a subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Acknowledgement sent once when the stream opens.
    Connected,
    /// Something changed upstream.
    Update,
}

impl EventKind {
    /// Wire name, also used as the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Update => "update",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level operation reported by the upstream change feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOperation {
    #[serde(alias = "INSERT", alias = "Insert")]
    Insert,
    #[default]
    #[serde(alias = "UPDATE", alias = "Update")]
    Update,
    #[serde(alias = "DELETE", alias = "Delete")]
    Delete,
    /// Statement-level; never carries a row.
    #[serde(alias = "TRUNCATE", alias = "Truncate")]
    Truncate,
}

/// An ephemeral notification. Never persisted, never replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    /// Table or topic the change belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<RowOperation>,
    /// The changed row, when the source provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChangeEvent {
    /// The acknowledgement a transport sends right after registering.
    pub fn connected() -> Self {
        Self {
            kind: EventKind::Connected,
            subject: None,
            operation: None,
            payload: None,
            message: Some(CONNECTED_MESSAGE.to_string()),
        }
    }

    /// A bare update notification.
    pub fn update() -> Self {
        Self {
            kind: EventKind::Update,
            subject: None,
            operation: None,
            payload: None,
            message: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_operation(mut self, operation: RowOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A normalized row change from the upstream database.
///
/// Deserializes from the body a database webhook or `pg_notify` trigger
/// emits:
///
/// ```json
/// { "type": "INSERT", "table": "items", "schema": "public",
///   "record": { "barcode": "4800016", "name": "Sardines" }, "old_record": null }
/// ```
///
/// A change without a table is a generic "something changed" signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(rename = "type", default)]
    pub operation: RowOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl RowChange {
    /// Create a change for a table with no row data.
    pub fn new(table: impl Into<String>, operation: RowOperation) -> Self {
        Self {
            table: Some(table.into()),
            operation,
            ..Default::default()
        }
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_old_record(mut self, old_record: Value) -> Self {
        self.old_record = Some(old_record);
        self
    }

    /// Convert into the update event broadcast to subscribers.
    ///
    /// Deletes carry the old row since there is no new one.
    pub fn into_event(self) -> ChangeEvent {
        let payload = match self.operation {
            RowOperation::Delete => self.old_record.or(self.record),
            RowOperation::Insert | RowOperation::Update => self.record,
            RowOperation::Truncate => None,
        };

        ChangeEvent {
            kind: EventKind::Update,
            subject: self.table,
            operation: Some(self.operation),
            payload: payload.filter(|value| !value.is_null()),
            message: None,
        }
    }
}
