//! Read-through cache of accessory characteristic values.
//!
//! Readers load an immutable [`CacheSnapshot`]; writers build a new snapshot
//! and swap it in, so a reader never sees a half-updated map. The stored
//! device hash identifies the topology the values belong to; the TTL only
//! bounds how long values are trusted without a warm.

use crate::clock::SharedClock;
use crate::error::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default TTL safety net.
pub const DEFAULT_TTL_SECS: u64 = 5 * 60;

/// Characteristic name to formatted value.
pub type CharacteristicValues = BTreeMap<String, String>;

/// On-disk and in-memory shape of the cache (`cache.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSnapshot {
    pub values: HashMap<String, CharacteristicValues>,
    pub device_hash: Option<String>,
    pub last_warmed: Option<DateTime<Utc>>,
}

/// Content hash over the sorted, de-duplicated accessory id set.
pub fn device_hash<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let sorted: BTreeSet<&str> = ids.into_iter().collect();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub struct StateCache {
    path: Option<PathBuf>,
    snapshot: ArcSwap<CacheSnapshot>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    ttl: Duration,
    clock: SharedClock,
}

impl StateCache {
    /// Empty cache that never touches disk.
    pub fn in_memory(ttl_secs: u64, clock: SharedClock) -> Self {
        Self::with_snapshot(None, CacheSnapshot::default(), ttl_secs, clock)
    }

    /// Load from `path`. Missing or corrupt files yield an empty cache.
    pub fn load(path: PathBuf, ttl_secs: u64, clock: SharedClock) -> Self {
        let snapshot = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheSnapshot>(&bytes) {
                Ok(snapshot) => {
                    info!(
                        "[Cache] Loaded {} accessories from {:?}",
                        snapshot.values.len(),
                        path
                    );
                    snapshot
                }
                Err(e) => {
                    warn!("[Cache] Ignoring corrupt cache file {:?}: {}", path, e);
                    CacheSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[Cache] No cache file at {:?}", path);
                CacheSnapshot::default()
            }
            Err(e) => {
                warn!("[Cache] Failed to read {:?}: {}", path, e);
                CacheSnapshot::default()
            }
        };
        Self::with_snapshot(Some(path), snapshot, ttl_secs, clock)
    }

    fn with_snapshot(
        path: Option<PathBuf>,
        snapshot: CacheSnapshot,
        ttl_secs: u64,
        clock: SharedClock,
    ) -> Self {
        Self {
            path,
            snapshot: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
            ttl: Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64),
            clock,
        }
    }

    /// Current snapshot. Cheap; holds no lock.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.load_full()
    }

    pub fn cached_state(&self, accessory_id: &str) -> Option<CharacteristicValues> {
        self.snapshot.load().values.get(accessory_id).cloned()
    }

    pub fn cached_accessory_count(&self) -> usize {
        self.snapshot.load().values.len()
    }

    pub fn last_warmed(&self) -> Option<DateTime<Utc>> {
        self.snapshot.load().last_warmed
    }

    /// True if never warmed or warmed longer than the TTL ago.
    pub fn is_stale(&self) -> bool {
        match self.snapshot.load().last_warmed {
            Some(warmed) => self.clock.now() - warmed > self.ttl,
            None => true,
        }
    }

    pub fn device_hash_matches(&self, hash: &str) -> bool {
        self.snapshot.load().device_hash.as_deref() == Some(hash)
    }

    /// Replace one accessory's whole value map.
    pub fn set_values(&self, accessory_id: impl Into<String>, values: CharacteristicValues) {
        let _guard = self.write_lock.lock();
        let mut next = CacheSnapshot::clone(&self.snapshot.load());
        next.values.insert(accessory_id.into(), values);
        self.snapshot.store(Arc::new(next));
    }

    /// Record `hash` and now as the warm baseline, then persist.
    pub fn mark_warmed(&self, hash: impl Into<String>) {
        let _guard = self.write_lock.lock();
        let mut next = CacheSnapshot::clone(&self.snapshot.load());
        next.device_hash = Some(hash.into());
        next.last_warmed = Some(self.clock.now());
        self.install(next);
    }

    /// Install a complete warm result in one swap.
    ///
    /// When `hash` differs from the stored one every previous entry is
    /// dropped first; otherwise entries are refreshed in place.
    pub fn apply_warm(&self, values: HashMap<String, CharacteristicValues>, hash: String) {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        let mut next = if current.device_hash.as_deref() == Some(hash.as_str()) {
            CacheSnapshot::clone(&current)
        } else {
            if current.device_hash.is_some() {
                info!("[Cache] Topology changed, rebuilding");
            }
            CacheSnapshot::default()
        };
        next.values.extend(values);
        next.device_hash = Some(hash);
        next.last_warmed = Some(self.clock.now());
        self.install(next);
    }

    /// Drop every entry, the hash and the warm timestamp.
    pub fn invalidate_values(&self) {
        let _guard = self.write_lock.lock();
        info!("[Cache] Invalidated");
        self.install(CacheSnapshot::default());
    }

    fn install(&self, next: CacheSnapshot) {
        let next = Arc::new(next);
        self.snapshot.store(next.clone());
        if let Some(path) = &self.path
            && let Err(e) = persist(path, &next)
        {
            warn!("[Cache] Failed to persist {:?}: {}", path, e);
        }
    }
}

fn persist(path: &Path, snapshot: &CacheSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn values(pairs: &[(&str, &str)]) -> CharacteristicValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new("2025-03-01T12:00:00Z".parse().unwrap()))
    }

    #[test]
    fn test_device_hash_ignores_order() {
        assert_eq!(device_hash(["a", "b", "c"]), device_hash(["c", "a", "b"]));
        assert_eq!(device_hash(["a", "b"]), device_hash(["b", "a", "b"]));
    }

    #[test]
    fn test_device_hash_changes_with_topology() {
        let base = device_hash(["a", "b"]);
        assert_ne!(base, device_hash(["a", "b", "c"]));
        assert_ne!(base, device_hash(["a"]));
        // Separator prevents "ab" colliding with "a" + "b"
        assert_ne!(device_hash(["ab"]), device_hash(["a", "b"]));
    }

    #[test]
    fn test_hash_match_after_mark_warmed() {
        let cache = StateCache::in_memory(DEFAULT_TTL_SECS, clock());
        let hash = device_hash(["a", "b"]);
        assert!(!cache.device_hash_matches(&hash));

        cache.mark_warmed(hash.clone());
        assert!(cache.device_hash_matches(&hash));
        assert!(cache.device_hash_matches(&device_hash(["b", "a"])));
        assert!(!cache.device_hash_matches(&device_hash(["a", "b", "c"])));
        assert!(!cache.device_hash_matches(&device_hash(["a"])));
    }

    #[test]
    fn test_set_values_replaces_whole_entry() {
        let cache = StateCache::in_memory(DEFAULT_TTL_SECS, clock());
        cache.set_values("lamp", values(&[("power", "true"), ("brightness", "80")]));
        cache.set_values("lamp", values(&[("power", "false")]));

        assert_eq!(cache.cached_state("lamp"), Some(values(&[("power", "false")])));
        assert_eq!(cache.cached_accessory_count(), 1);
        assert_eq!(cache.cached_state("other"), None);
    }

    #[test]
    fn test_staleness_follows_ttl() {
        let clock = clock();
        let cache = StateCache::in_memory(60, clock.clone());
        assert!(cache.is_stale());

        cache.mark_warmed("h");
        assert!(!cache.is_stale());
        assert_eq!(cache.last_warmed(), Some(clock.now()));

        clock.advance(Duration::seconds(60));
        assert!(!cache.is_stale());
        clock.advance(Duration::seconds(1));
        assert!(cache.is_stale());
    }

    #[test]
    fn test_invalidate_clears_everything() {
        let cache = StateCache::in_memory(DEFAULT_TTL_SECS, clock());
        cache.set_values("a", values(&[("power", "true")]));
        cache.set_values("b", values(&[("power", "false")]));
        cache.mark_warmed(device_hash(["a", "b"]));

        cache.invalidate_values();

        assert_eq!(cache.cached_state("a"), None);
        assert_eq!(cache.cached_state("b"), None);
        assert_eq!(cache.cached_accessory_count(), 0);
        assert_eq!(cache.last_warmed(), None);
        assert!(cache.is_stale());
        assert!(!cache.device_hash_matches(&device_hash(["a", "b"])));
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = StateCache::in_memory(DEFAULT_TTL_SECS, clock());
        cache.set_values("a", values(&[("power", "true")]));
        let before = cache.snapshot();

        cache.invalidate_values();

        assert_eq!(before.values.len(), 1);
        assert!(cache.snapshot().values.is_empty());
    }

    #[test]
    fn test_apply_warm_rebuilds_on_hash_mismatch() {
        let cache = StateCache::in_memory(DEFAULT_TTL_SECS, clock());
        let mut first = HashMap::new();
        first.insert("a".to_string(), values(&[("power", "true")]));
        first.insert("b".to_string(), values(&[("power", "true")]));
        cache.apply_warm(first, device_hash(["a", "b"]));
        assert_eq!(cache.cached_accessory_count(), 2);

        let mut second = HashMap::new();
        second.insert("a".to_string(), values(&[("power", "false")]));
        cache.apply_warm(second, device_hash(["a"]));

        assert_eq!(cache.cached_state("b"), None);
        assert_eq!(cache.cached_state("a"), Some(values(&[("power", "false")])));
        assert!(cache.device_hash_matches(&device_hash(["a"])));
    }

    #[test]
    fn test_persisted_snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let clock = clock();

        let cache = StateCache::load(path.clone(), DEFAULT_TTL_SECS, clock.clone());
        cache.set_values("a", values(&[("temperature", "21.5°C")]));
        cache.mark_warmed(device_hash(["a"]));

        let reloaded = StateCache::load(path.clone(), DEFAULT_TTL_SECS, clock.clone());
        assert_eq!(
            reloaded.cached_state("a"),
            Some(values(&[("temperature", "21.5°C")]))
        );
        assert!(reloaded.device_hash_matches(&device_hash(["a"])));
        assert_eq!(reloaded.last_warmed(), Some(clock.now()));

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(json.get("deviceHash").is_some());
        assert!(json.get("lastWarmed").is_some());
    }

    #[test]
    fn test_corrupt_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"\x00\x01 nope").unwrap();

        let cache = StateCache::load(path, DEFAULT_TTL_SECS, clock());
        assert_eq!(cache.cached_accessory_count(), 0);
        assert!(cache.is_stale());
    }
}
