//! Fast-path cache of the latest merged record per aircraft.
//!
//! Bounded by an entry cap (least recently written evicted first) and by an
//! idle TTL measured from the last write. Reads take a shared lock and never
//! reorder the LRU list, so viewers and HTTP reads do not contend with each
//! other. The durable store stays the source of truth.

use crate::entities::AircraftLiveRecord;
use compact_str::CompactString;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Entry {
    record: AircraftLiveRecord,
    touched: Instant,
}

pub struct LiveStateStore {
    cache: RwLock<LruCache<CompactString, Entry>>,
    ttl: Duration,
}

impl LiveStateStore {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Insert or replace the record for its key and reset its idle timer.
    pub fn upsert_state(&self, record: AircraftLiveRecord) {
        let key = record.hex.clone();
        let entry = Entry {
            record,
            touched: Instant::now(),
        };
        if let Some((evicted, _)) = self.cache.write().push(key.clone(), entry) {
            if evicted != key {
                debug!(entity_key = %evicted, "Live cache at capacity, evicted oldest entry");
            }
        }
    }

    /// The cached record, unless absent or idle past the TTL.
    pub fn get(&self, hex: &str) -> Option<AircraftLiveRecord> {
        let now = Instant::now();
        let cache = self.cache.read();
        cache
            .peek(hex)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.record.clone())
    }

    /// Every unexpired record, most recently written first.
    pub fn snapshot(&self) -> Vec<AircraftLiveRecord> {
        let now = Instant::now();
        let cache = self.cache.read();
        cache
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(_, entry)| entry.record.clone())
            .collect()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write();
        let mut removed = 0;
        // Least recently written sit at the tail; stop at the first live one.
        while let Some((_, entry)) = cache.peek_lru() {
            if !self.is_expired(entry, now) {
                break;
            }
            cache.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.touched) >= self.ttl
    }

    /// Periodically purge expired entries until shutdown.
    pub async fn run_janitor(&self, mut shutdown_rx: watch::Receiver<bool>, interval: Duration) {
        info!("Live cache janitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Live cache janitor received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let removed = self.evict_expired();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "Evicted idle live entries");
                    }
                }
            }
        }

        info!("Live cache janitor shutdown complete");
    }
}
