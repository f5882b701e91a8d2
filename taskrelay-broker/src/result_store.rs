use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, warn};
use parking_lot::Mutex;
use taskrelay_comm::decode_result;
use tokio::time::Instant;

use crate::types::DEFAULT_RESULT_TTL;

/// Shortest accepted time-to-live; Redis `EX` cannot express less.
pub const MIN_RESULT_TTL: Duration = Duration::from_secs(1);
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: String,
    /// `None` when the TTL is too large to represent: the entry never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_purge: Option<Instant>,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before - self.map.len()
    }
}

/// String key-value store with a per-entry time-to-live.
///
/// Holds serialized results keyed by task id. Writes are last-write-wins and
/// expired entries are invisible to readers. Writes also sweep out expired
/// entries, at most once per TTL (capped at a minute), so results nobody
/// reads do not pile up.
#[derive(Clone)]
pub struct ResultStore {
    ttl: Duration,
    entries: Arc<Mutex<Entries>>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_TTL)
    }
}

impl ResultStore {
    /// A TTL below one second is raised to [`MIN_RESULT_TTL`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.max(MIN_RESULT_TTL),
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let now = Instant::now();
        let entry = Entry {
            value: value.into(),
            expires_at: now.checked_add(self.ttl),
        };

        let mut entries = self.entries.lock();
        if entries.next_purge.map_or(true, |at| now >= at) {
            let purged = entries.purge(now);
            if purged > 0 {
                debug!("Purged {} expired results", purged);
            }
            entries.next_purge = now.checked_add(self.ttl.min(MAX_PURGE_INTERVAL));
        }
        entries.map.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn evict(&self, key: &str) -> bool {
        self.entries.lock().map.remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.lock().purge(Instant::now())
    }

    /// Entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a serialized result message under its own task id.
    ///
    /// Returns the task id, or `None` when the message is malformed and dropped.
    pub fn absorb(&self, body: &[u8]) -> Option<String> {
        let result = match decode_result(body) {
            Ok(result) => result,
            Err(err) => {
                warn!("Dropping malformed result message: {}", err);
                return None;
            }
        };
        let Ok(raw) = String::from_utf8(body.to_vec()) else {
            warn!("Dropping non UTF-8 result for task {}", result.task_id);
            return None;
        };
        debug!("Storing result for task {}", result.task_id);
        self.set(result.task_id.clone(), raw);
        Some(result.task_id)
    }
}
