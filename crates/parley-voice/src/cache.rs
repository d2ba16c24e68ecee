//! On-disk cache bookkeeping for recordings and synthesized audio.
//!
//! Producers write files and `register` them; only the manager deletes.
//! A [`CacheFence`] pins an entry while a recognition or playback still needs
//! it; fenced entries are skipped by eviction even when over budget.

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Bounds for one cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    /// Total bytes kept on disk
    pub max_bytes: u64,
    /// Entries older than this are evicted
    pub max_age_secs: u64,
    /// Maximum number of files
    pub max_entries: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_age_secs: 7 * 24 * 60 * 60,
            max_entries: 50,
        }
    }
}

impl CacheLimits {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub recordings_dir: PathBuf,
    pub synthesis_dir: PathBuf,
    pub recordings: CacheLimits,
    pub synthesis: CacheLimits,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recording_cache"),
            synthesis_dir: PathBuf::from("tts_cache"),
            recordings: CacheLimits::default(),
            synthesis: CacheLimits {
                max_entries: 20,
                ..CacheLimits::default()
            },
        }
    }
}

/// A file tracked by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub created_at: SystemTime,
    pub size: u64,
}

impl CacheEntry {
    /// Build an entry from the file's metadata.
    pub fn from_file(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)?;
        let created_at = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Ok(Self {
            path,
            created_at,
            size: meta.len(),
        })
    }
}

/// What one eviction pass did.
#[derive(Debug, Default, Clone)]
pub struct EvictionReport {
    pub removed: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub skipped_fenced: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: Vec<CacheEntry>,
    fences: HashMap<PathBuf, usize>,
}

fn lock(index: &Mutex<CacheIndex>) -> MutexGuard<'_, CacheIndex> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pins a cache entry against eviction until dropped.
#[derive(Debug)]
pub struct CacheFence {
    path: PathBuf,
    index: Arc<Mutex<CacheIndex>>,
}

impl CacheFence {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheFence {
    fn drop(&mut self) {
        let mut index = lock(&self.index);
        if let Some(count) = index.fences.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                index.fences.remove(&self.path);
            }
        }
    }
}

/// Tracks and bounds one cache directory.
#[derive(Debug)]
pub struct CacheManager {
    name: &'static str,
    dir: PathBuf,
    limits: CacheLimits,
    index: Arc<Mutex<CacheIndex>>,
}

impl CacheManager {
    /// Open (creating if needed) a cache directory and track the files already in it.
    pub fn open(name: &'static str, dir: impl Into<PathBuf>, limits: CacheLimits) -> Result<Self, VoiceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| VoiceError::CacheIo(format!("{}: cannot create {}: {}", name, dir.display(), e)))?;

        let mut entries = Vec::new();
        let listing = fs::read_dir(&dir)
            .map_err(|e| VoiceError::CacheIo(format!("{}: cannot list {}: {}", name, dir.display(), e)))?;
        for item in listing.flatten() {
            let path = item.path();
            if path.is_file() {
                match CacheEntry::from_file(&path) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(cache = name, path = %path.display(), error = %e, "Skipping unreadable cache file"),
                }
            }
        }
        entries.sort_by_key(|e| e.created_at);

        info!(
            cache = name,
            dir = %dir.display(),
            entries = entries.len(),
            max_entries = limits.max_entries,
            "📁 Cache opened"
        );

        let manager = Self {
            name,
            dir,
            limits,
            index: Arc::new(Mutex::new(CacheIndex {
                entries,
                fences: HashMap::new(),
            })),
        };
        manager.enforce_limits();
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Track a newly written file, then evict against the configured limits.
    pub fn register(&self, entry: CacheEntry) -> EvictionReport {
        {
            let mut index = lock(&self.index);
            index.entries.retain(|e| e.path != entry.path);
            index.entries.push(entry);
            index.entries.sort_by_key(|e| e.created_at);
        }
        self.enforce_limits()
    }

    /// Evict oldest-first until total size and age bounds hold.
    pub fn enforce(&self, max_total_size: u64, max_age: Duration) -> EvictionReport {
        self.evict(max_total_size, Some(max_age), None)
    }

    /// Evict against the configured size, age and count limits.
    pub fn enforce_limits(&self) -> EvictionReport {
        self.evict(
            self.limits.max_bytes,
            Some(self.limits.max_age()),
            Some(self.limits.max_entries),
        )
    }

    fn evict(&self, max_bytes: u64, max_age: Option<Duration>, max_entries: Option<usize>) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut index = lock(&self.index);
        let now = SystemTime::now();

        let mut total: u64 = index.entries.iter().map(|e| e.size).sum();
        let mut count = index.entries.len();
        let entries = std::mem::take(&mut index.entries);
        let mut kept = Vec::with_capacity(entries.len());

        for entry in entries {
            let expired = max_age
                .map(|age| now.duration_since(entry.created_at).unwrap_or_default() > age)
                .unwrap_or(false);
            let over_budget = total > max_bytes || max_entries.map_or(false, |max| count > max);
            if !expired && !over_budget {
                kept.push(entry);
                continue;
            }
            if index.fences.contains_key(&entry.path) {
                report.skipped_fenced += 1;
                kept.push(entry);
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        cache = self.name,
                        path = %entry.path.display(),
                        error = %VoiceError::CacheIo(e.to_string()),
                        "Eviction failed, keeping entry"
                    );
                    report.errors += 1;
                    kept.push(entry);
                    continue;
                }
            }
            debug!(cache = self.name, path = %entry.path.display(), "🗑️ Evicted");
            total = total.saturating_sub(entry.size);
            count -= 1;
            report.bytes_freed += entry.size;
            report.removed.push(entry.path);
        }

        index.entries = kept;
        if !report.removed.is_empty() {
            debug!(
                cache = self.name,
                removed = report.removed.len(),
                bytes = report.bytes_freed,
                "Cache eviction pass"
            );
        }
        report
    }

    /// Pin `path` against eviction.
    pub fn fence(&self, path: impl Into<PathBuf>) -> CacheFence {
        let path = path.into();
        *lock(&self.index).fences.entry(path.clone()).or_insert(0) += 1;
        CacheFence {
            path,
            index: Arc::clone(&self.index),
        }
    }

    /// Pin `path` only if it is tracked and still on disk. A tracked entry whose file
    /// vanished is forgotten.
    pub fn fence_existing(&self, path: &Path) -> Option<CacheFence> {
        let mut index = lock(&self.index);
        if !index.entries.iter().any(|e| e.path == path) {
            return None;
        }
        if !path.is_file() {
            index.entries.retain(|e| e.path != path);
            return None;
        }
        *index.fences.entry(path.to_path_buf()).or_insert(0) += 1;
        Some(CacheFence {
            path: path.to_path_buf(),
            index: Arc::clone(&self.index),
        })
    }

    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.index).entries.iter().any(|e| e.path == path)
    }

    pub fn is_fenced(&self, path: &Path) -> bool {
        lock(&self.index).fences.contains_key(path)
    }

    pub fn len(&self) -> usize {
        lock(&self.index).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> u64 {
        lock(&self.index).entries.iter().map(|e| e.size).sum()
    }
}
