use chrono::Utc;
use dexquote_core_types::PriceObservation;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Fixed per-entry footprint estimate. Host-runtime memory introspection is
/// deliberately avoided; these are stable upper bounds for the observation
/// struct, the map slot and the owned key.
const BYTES_PER_ENTRY: usize = 400;
const MAP_OVERHEAD: usize = 48;
const KEY_OVERHEAD: usize = 64;
const ENTRY_FOOTPRINT: usize = BYTES_PER_ENTRY + MAP_OVERHEAD + KEY_OVERHEAD;

/// After a cleanup pass the footprint is brought down to this fraction of the
/// ceiling, so consecutive puts don't immediately re-trigger eviction.
const LOW_WATER_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub usage_bytes: usize,
    pub max_bytes: usize,
    pub entries: usize,
    pub usage_pct: f64,
    pub oldest_age_ms: Option<i64>,
    pub newest_age_ms: Option<i64>,
}

struct Slot {
    observation: PriceObservation,
    seq: u64,
}

struct Inner {
    map: HashMap<String, Slot>,
    /// Recency index: sequence number -> mint. Smallest key is the
    /// least-recently-used entry, so eviction sweeps the prefix.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Inner {
    fn touch(&mut self, mint: &str) {
        let Some(slot) = self.map.get_mut(mint) else {
            return;
        };
        self.order.remove(&slot.seq);
        slot.seq = self.next_seq;
        self.order.insert(self.next_seq, mint.to_string());
        self.next_seq += 1;
    }

    fn footprint(&self) -> usize {
        self.map.len() * ENTRY_FOOTPRINT
    }
}

/// Bounded mapping from mint to its latest observation with LRU eviction
/// under a byte ceiling. Operations never suspend; mutations are serialized
/// behind the inner mutex so the ingestion task and request handlers can
/// share one handle.
pub struct PriceCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    cleanup_threshold: f64,
}

impl PriceCache {
    pub fn new(max_bytes: usize, cleanup_threshold: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            max_bytes: max_bytes.max(ENTRY_FOOTPRINT),
            cleanup_threshold: cleanup_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn with_megabytes(megabytes: u64, cleanup_threshold: f64) -> Self {
        Self::new((megabytes as usize) * 1024 * 1024, cleanup_threshold)
    }

    /// Inserts or overwrites the observation for its mint and promotes the
    /// entry to most-recently-used. Runs a cleanup pass when the estimated
    /// footprint crosses the trigger threshold.
    pub fn put(&self, mut observation: PriceObservation) {
        let now_ms = Utc::now().timestamp_millis();
        observation.last_access_ms = now_ms;
        let mint = observation.mint.clone();

        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        match inner.map.get_mut(&mint) {
            Some(slot) => {
                slot.observation = observation;
                inner.touch(&mint);
            }
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.map.insert(
                    mint.clone(),
                    Slot {
                        observation,
                        seq,
                    },
                );
                inner.order.insert(seq, mint);
            }
        }

        let trigger = (self.max_bytes as f64 * self.cleanup_threshold) as usize;
        if inner.footprint() > trigger {
            self.evict_locked(&mut inner);
        }
    }

    /// Returns the current observation and promotes the entry. Only
    /// `last_access_ms` and the access order change.
    pub fn get(&self, mint: &str) -> Option<PriceObservation> {
        let now_ms = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        if !inner.map.contains_key(mint) {
            return None;
        }
        inner.touch(mint);
        let slot = inner.map.get_mut(mint)?;
        slot.observation.last_access_ms = now_ms;
        Some(slot.observation.clone())
    }

    /// Snapshot of every entry without touching the access order.
    pub fn get_all(&self) -> Vec<PriceObservation> {
        let inner = self.inner.lock().expect("price cache lock poisoned");
        inner
            .map
            .values()
            .map(|slot| slot.observation.clone())
            .collect()
    }

    pub fn remove(&self, mint: &str) -> Option<PriceObservation> {
        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        let slot = inner.map.remove(mint)?;
        inner.order.remove(&slot.seq);
        Some(slot.observation)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("price cache lock poisoned")
            .map
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now_ms = Utc::now().timestamp_millis();
        let inner = self.inner.lock().expect("price cache lock poisoned");
        let usage_bytes = inner.footprint();
        let mut oldest_stored = None::<i64>;
        let mut newest_stored = None::<i64>;
        for slot in inner.map.values() {
            let stored = slot.observation.stored_at_ms;
            oldest_stored = Some(oldest_stored.map_or(stored, |current| current.min(stored)));
            newest_stored = Some(newest_stored.map_or(stored, |current| current.max(stored)));
        }
        CacheStats {
            usage_bytes,
            max_bytes: self.max_bytes,
            entries: inner.map.len(),
            usage_pct: usage_bytes as f64 / self.max_bytes as f64 * 100.0,
            oldest_age_ms: oldest_stored.map(|stored| (now_ms - stored).max(0)),
            newest_age_ms: newest_stored.map(|stored| (now_ms - stored).max(0)),
        }
    }

    fn evict_locked(&self, inner: &mut Inner) {
        let low_water = (self.max_bytes as f64 * LOW_WATER_FRACTION) as usize;
        let before = inner.map.len();
        while inner.footprint() > low_water {
            let Some((&seq, _)) = inner.order.iter().next() else {
                break;
            };
            let Some(mint) = inner.order.remove(&seq) else {
                break;
            };
            inner.map.remove(&mint);
        }
        debug!(
            evicted = before - inner.map.len(),
            remaining = inner.map.len(),
            usage_bytes = inner.footprint(),
            "price cache cleanup pass"
        );
    }
}
