//! Resolution cache
//!
//! Geocoding and demographic lookups are cached under two kinds of key:
//! - `coord:{lat},{lon}`: coordinate rounded to a fixed number of decimals
//! - `geoid:{geoid}`: ACS record of a tract
//!
//! Definitive absence ("no tract here", "no ACS record") is cached too.
//! Upstream failures never are.

use crate::resolver::census_api::AcsRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Cached outcome of one lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CachedLookup {
    /// Coordinate resolved to this tract
    Tract { geoid: String },
    /// Geocoder found no tract at the coordinate
    NoTract,
    /// ACS record for a tract
    Demographics { record: AcsRecord },
    /// ACS has no record for the tract
    NoDemographics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedLookup,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: CachedLookup) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
        }
    }

    /// True when older than `max_age`
    pub fn is_expired(&self, max_age: Option<chrono::Duration>) -> bool {
        max_age.map_or(false, |age| Utc::now() - self.cached_at > age)
    }
}

/// Storage for resolved lookups, injected into the resolver
pub trait ResolutionCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;

    fn put(&self, key: &str, value: CachedLookup);

    /// Persist pending writes (no-op for in-memory caches)
    fn flush(&self) -> Result<()>;
}

pub fn coordinate_key(latitude: f64, longitude: f64, precision: usize) -> String {
    format!("coord:{:.*},{:.*}", precision, latitude, precision, longitude)
}

pub fn geoid_key(geoid: &str) -> String {
    format!("geoid:{}", geoid)
}

// ============================================================================
// In-memory cache
// ============================================================================

/// Process-local cache on `moka`
pub struct MemoryCache {
    entries: Cache<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl ResolutionCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key)
    }

    fn put(&self, key: &str, value: CachedLookup) {
        self.entries.insert(key.to_string(), CacheEntry::new(value));
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// JSON file cache
// ============================================================================

/// Cache persisted as one JSON object across runs
///
/// A missing or unreadable file starts an empty cache. Writes go to a
/// temporary file first and are renamed into place.
pub struct JsonFileCache {
    path: PathBuf,
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    dirty: AtomicBool,
}

impl JsonFileCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read_entries(&path) {
            Ok(Some(entries)) => {
                info!(path = ?path, entries = entries.len(), "Loaded resolution cache");
                entries
            }
            Ok(None) => FxHashMap::default(),
            Err(e) => {
                warn!(path = ?path, error = %format!("{:#}", e), "Ignoring unreadable resolution cache");
                FxHashMap::default()
            }
        };

        Self {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    fn read_entries(path: &Path) -> Result<Option<FxHashMap<String, CacheEntry>>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache file: {:?}", path))?;
        let entries: FxHashMap<String, CacheEntry> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file: {:?}", path))?;
        Ok(Some(entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResolutionCache for JsonFileCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: CachedLookup) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), CacheEntry::new(value));
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        // Sorted keys keep the file diffable
        let snapshot: BTreeMap<String, CacheEntry> = match self.entries.read() {
            Ok(entries) => entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => anyhow::bail!("resolution cache lock poisoned"),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write cache file: {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move cache file into place: {:?}", self.path))?;

        debug!(path = ?self.path, entries = snapshot.len(), "Flushed resolution cache");
        Ok(())
    }
}

impl Drop for JsonFileCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %format!("{:#}", e), "Failed to flush resolution cache on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tract_store::Demographics;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "site_feature_engine_{}_{}_{}.json",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn test_coordinate_key_rounds() {
        assert_eq!(coordinate_key(28.56851234, -81.2163, 6), "coord:28.568512,-81.216300");
        assert_eq!(geoid_key("12095016502"), "geoid:12095016502");
    }

    #[test]
    fn test_memory_cache_round_trip() {
        let cache = MemoryCache::default();
        assert!(cache.get("coord:1,2").is_none());
        cache.put("coord:1,2", CachedLookup::NoTract);
        assert_eq!(cache.get("coord:1,2").unwrap().value, CachedLookup::NoTract);
    }

    #[test]
    fn test_json_cache_persists_across_instances() {
        let path = temp_path("persist");
        {
            let cache = JsonFileCache::open(&path);
            cache.put("coord:28.5,-81.3", CachedLookup::Tract { geoid: "12095016502".into() });
            cache.put(
                "geoid:12095016502",
                CachedLookup::Demographics {
                    record: AcsRecord {
                        geoid: "12095016502".into(),
                        name: None,
                        demographics: Demographics {
                            total_population: Some(4000.0),
                            ..Default::default()
                        },
                    },
                },
            );
            cache.flush().unwrap();
        }

        let reopened = JsonFileCache::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get("coord:28.5,-81.3").unwrap().value,
            CachedLookup::Tract { geoid: "12095016502".into() }
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_cache_file_starts_empty() {
        let path = temp_path("corrupt");
        fs::write(&path, "{ not json").unwrap();
        let cache = JsonFileCache::open(&path);
        assert!(cache.is_empty());
        cache.put("geoid:12095016502", CachedLookup::NoDemographics);
        cache.flush().unwrap();
        assert_eq!(JsonFileCache::open(&path).len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_expiry() {
        let mut entry = CacheEntry::new(CachedLookup::NoTract);
        assert!(!entry.is_expired(None));
        entry.cached_at = Utc::now() - chrono::Duration::days(10);
        assert!(entry.is_expired(Some(chrono::Duration::days(7))));
        assert!(!entry.is_expired(Some(chrono::Duration::days(30))));
    }
}
