//! Shared durable storage: the polling transport tier and the timer record.

use super::error::{StorageError, TransportError};
use super::transport::{Transport, TransportKind};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use shared::{StoredTimerRecord, TimerSnapshot, TimingSection};
use std::rc::Rc;

/// String key/value area shared by every context of one origin.
///
/// Methods take `&self`; implementations use interior mutability the way the
/// browser's storage object does.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

const SEEN_CAPACITY: usize = 512;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct StoredEnvelope {
    at: i64,
    raw: String,
}

struct PolledRecord {
    at: i64,
    source: String,
    seq: u64,
    key: String,
    raw: String,
}

/// Tertiary tier. Every publish writes a uniquely keyed, timestamped record
/// `{prefix}:{source}:{seq}`; readers poll, skip their own records and
/// delete anything older than the prune age.
pub struct StorageTransport {
    store: Rc<dyn KeyValueStore>,
    prefix: String,
    source: String,
    seq: u64,
    poll_interval_ms: i64,
    prune_age_ms: i64,
    opened_at_ms: i64,
    last_poll_at: Option<i64>,
    seen: IndexSet<String>,
    open: bool,
}

impl StorageTransport {
    pub fn new(
        store: Rc<dyn KeyValueStore>,
        prefix: impl Into<String>,
        source: impl Into<String>,
        timing: &TimingSection,
        now_ms: i64,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            source: source.into(),
            seq: 0,
            poll_interval_ms: timing.storage_poll_interval_ms as i64,
            prune_age_ms: timing.storage_prune_age_ms as i64,
            opened_at_ms: now_ms,
            last_poll_at: None,
            seen: IndexSet::new(),
            open: true,
        }
    }

    fn record_key(&self, seq: u64) -> String {
        format!("{}:{}:{}", self.prefix, self.source, seq)
    }

    /// `(source, seq)` of a key under this transport's prefix.
    fn parse_key<'a>(&self, key: &'a str) -> Option<(&'a str, u64)> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        let (source, seq) = rest.rsplit_once(':')?;
        Some((source, seq.parse().ok()?))
    }

    fn remember(&mut self, key: String) {
        self.seen.insert(key);
        while self.seen.len() > SEEN_CAPACITY {
            self.seen.shift_remove_index(0);
        }
    }

    fn forget(&mut self, key: &str) {
        if let Err(error) = self.store.remove(key) {
            log::debug!("Failed to prune {}: {}", key, error);
        }
        self.seen.shift_remove(key);
    }

    fn poll(&mut self, now_ms: i64) -> Result<Vec<String>, StorageError> {
        let mut fresh = Vec::new();
        for key in self.store.keys()? {
            let Some((source, seq)) = self.parse_key(&key) else {
                continue;
            };
            let source = source.to_string();

            let Some(value) = self.store.get(&key)? else {
                continue;
            };
            let record: StoredEnvelope = match serde_json::from_str(&value) {
                Ok(record) => record,
                Err(error) => {
                    log::debug!("Removing unreadable record {}: {}", key, error);
                    self.forget(&key);
                    continue;
                }
            };

            if now_ms - record.at > self.prune_age_ms {
                self.forget(&key);
                continue;
            }
            if source == self.source || self.seen.contains(&key) {
                continue;
            }
            if record.at < self.opened_at_ms {
                // Written before this context existed.
                self.remember(key);
                continue;
            }
            fresh.push(PolledRecord {
                at: record.at,
                source,
                seq,
                key,
                raw: record.raw,
            });
        }

        fresh.sort_by(|a, b| (a.at, &a.source, a.seq).cmp(&(b.at, &b.source, b.seq)));
        Ok(fresh
            .into_iter()
            .map(|record| {
                self.remember(record.key);
                record.raw
            })
            .collect())
    }
}

impl Transport for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn publish(&mut self, raw: &str, now_ms: i64) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed(TransportKind::Storage));
        }
        let key = self.record_key(self.seq);
        self.seq += 1;
        let record = StoredEnvelope {
            at: now_ms,
            raw: raw.to_string(),
        };
        let value = serde_json::to_string(&record).map_err(|error| TransportError::Write {
            kind: TransportKind::Storage,
            reason: error.to_string(),
        })?;
        self.store.set(&key, &value)?;
        Ok(())
    }

    fn drain(&mut self, now_ms: i64) -> Vec<String> {
        if !self.open {
            return Vec::new();
        }
        if let Some(last) = self.last_poll_at {
            if now_ms - last < self.poll_interval_ms {
                return Vec::new();
            }
        }
        self.last_poll_at = Some(now_ms);
        match self.poll(now_ms) {
            Ok(messages) => messages,
            Err(error) => {
                log::warn!("Storage poll failed: {}", error);
                Vec::new()
            }
        }
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// The fixed-key durable timer record.
#[derive(Clone)]
pub struct TimerStore {
    store: Rc<dyn KeyValueStore>,
    key: String,
}

impl TimerStore {
    pub fn new(store: Rc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `Ok(None)` when nothing was ever stored.
    pub fn load(&self) -> Result<Option<StoredTimerRecord>, StorageError> {
        let Some(value) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        serde_json::from_str(&value)
            .map(Some)
            .map_err(|error| StorageError::Decode {
                key: self.key.clone(),
                reason: error.to_string(),
            })
    }

    pub fn save(&self, snapshot: &TimerSnapshot) -> Result<(), StorageError> {
        let record = StoredTimerRecord::Current(snapshot.clone());
        let value = serde_json::to_string(&record).map_err(|error| StorageError::Write {
            key: self.key.clone(),
            reason: error.to_string(),
        })?;
        self.store.set(&self.key, &value)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(&self.key)
    }
}
