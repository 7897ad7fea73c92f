//! Persisted last-change timestamp.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{NotifyError, Result};

/// Tree holding process-wide status values.
const STATUS_TREE: &str = "app_status";

/// Key of the last-change timestamp inside [`STATUS_TREE`].
const LAST_CHANGE_KEY: &[u8] = b"last_change_at";

/// Storage for the time of the last relevant mutation.
pub trait TimestampStore: Send + Sync {
    /// Read the persisted timestamp, if one was ever written.
    fn load(&self) -> Result<Option<DateTime<Utc>>>;

    /// Persist `at` unless a later value is already stored.
    ///
    /// Returns the value that is stored after the write.
    fn store(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// Sled-backed [`TimestampStore`].
///
/// The value is a big-endian `i64` of Unix milliseconds. Writes go through
/// `update_and_fetch` so concurrent writers can only move it forward.
pub struct SledTimestampStore {
    tree: sled::Tree,
    db: sled::Db,
}

impl SledTimestampStore {
    /// Open (or create) a store at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::with_db(db)
    }

    /// Use an already open sled database.
    pub fn with_db(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree(STATUS_TREE)?;
        Ok(Self { tree, db })
    }

    /// Open a store that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl TimestampStore for SledTimestampStore {
    fn load(&self) -> Result<Option<DateTime<Utc>>> {
        match self.tree.get(LAST_CHANGE_KEY)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let candidate = at.timestamp_millis();

        // An undecodable old value is overwritten rather than kept forever.
        let stored = self.tree.update_and_fetch(LAST_CHANGE_KEY, |old| {
            let current = old
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(i64::from_be_bytes);
            let next = current.map_or(candidate, |current| current.max(candidate));
            Some(next.to_be_bytes().to_vec())
        })?;

        match stored {
            Some(bytes) => decode(&bytes),
            None => Err(NotifyError::CorruptTimestamp(
                "value missing after write".to_string(),
            )),
        }
    }
}

fn decode(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        NotifyError::CorruptTimestamp(format!("expected 8 bytes, found {}", bytes.len()))
    })?;
    let millis = i64::from_be_bytes(raw);
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| NotifyError::CorruptTimestamp(format!("out of range: {}", millis)))
}
