use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::paths;

const CACHE_FORMAT_VERSION: u32 = 1;
const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(text: &str, target_lang: &str, provider: &str, glossary_version: &str) -> Self {
        let mut material = normalize_source(text);
        for part in [target_lang, provider, glossary_version] {
            material.push(KEY_SEPARATOR);
            material.push_str(part);
        }
        Self(format!("{:x}", md5::compute(material.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn normalize_source(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub translated: String,
    pub provider: String,
    pub created_at: String,
}

impl CacheEntry {
    pub fn new(key: CacheKey, translated: impl Into<String>, provider: impl Into<String>) -> Self {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            key,
            translated: translated.into(),
            provider: provider.into(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Unchanged,
    Conflict,
}

impl StoreOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, StoreOutcome::Conflict)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<CacheKey, StoredEntry>,
    #[serde(default)]
    rejected: BTreeMap<CacheKey, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    translated: String,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    created_at: String,
}

#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
    rejected: DashMap<CacheKey, String>,
    path: Option<PathBuf>,
    persistent: AtomicBool,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
    warnings: Mutex<Vec<String>>,
}

impl CacheStore {
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            rejected: DashMap::new(),
            path: None,
            persistent: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Opens the store backed by `path`. Disk problems never fail the open.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::in_memory();
        store.path = Some(path.clone());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = fs::create_dir_all(parent) {
                store.degrade(format!(
                    "cache directory {} unavailable: {}",
                    parent.display(),
                    err
                ));
                return store;
            }
        }

        if !path.exists() {
            store.persistent.store(true, Ordering::SeqCst);
            return store;
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                store.degrade(format!("failed to read cache {}: {}", path.display(), err));
                return store;
            }
        };
        store.persistent.store(true, Ordering::SeqCst);

        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) => {
                for (key, stored) in file.entries {
                    store.entries.insert(
                        key.clone(),
                        CacheEntry {
                            key,
                            translated: stored.translated,
                            provider: stored.provider,
                            created_at: stored.created_at,
                        },
                    );
                }
                for (key, reason) in file.rejected {
                    store.rejected.insert(key, reason);
                }
                info!(
                    "loaded {} cached translations from {}",
                    store.entries.len(),
                    path.display()
                );
            }
            Err(err) => {
                let moved = move_aside(&path);
                let message = match moved {
                    Ok(bad) => format!(
                        "cache {} is corrupt ({}); moved to {}",
                        path.display(),
                        err,
                        bad.display()
                    ),
                    Err(move_err) => format!(
                        "cache {} is corrupt ({}) and could not be moved: {}",
                        path.display(),
                        err,
                        move_err
                    ),
                };
                warn!("{}", message);
                store.push_warning(message);
            }
        }
        store
    }

    /// Opens the cache file that belongs to `input` inside `cache_dir`.
    pub fn open_for_input(cache_dir: &Path, input: &Path) -> Self {
        Self::open(cache_path_for_input(cache_dir, input))
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn store(&self, entry: CacheEntry) -> StoreOutcome {
        let outcome = match self.entries.entry(entry.key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                StoreOutcome::Inserted
            }
            Entry::Occupied(existing) => {
                if existing.get().translated == entry.translated {
                    StoreOutcome::Unchanged
                } else {
                    warn!(
                        "cache conflict for {}: keeping existing translation from {}",
                        entry.key.as_str(),
                        existing.get().provider
                    );
                    StoreOutcome::Conflict
                }
            }
        };
        if outcome == StoreOutcome::Inserted {
            self.rejected.remove(&entry.key);
            self.dirty.store(true, Ordering::SeqCst);
        }
        outcome
    }

    pub fn reject(&self, key: &CacheKey, reason: impl Into<String>) {
        self.rejected.insert(key.clone(), reason.into());
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_rejected(&self, key: &CacheKey) -> bool {
        self.rejected.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .map(|warnings| warnings.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Persists pending writes. A failed write switches the store to memory-only.
    pub fn flush(&self) -> Result<()> {
        let _guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(path) = self.path() else {
            return Ok(());
        };
        if !self.is_persistent() || !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|item| {
                    let entry = item.value();
                    (
                        item.key().clone(),
                        StoredEntry {
                            translated: entry.translated.clone(),
                            provider: entry.provider.clone(),
                            created_at: entry.created_at.clone(),
                        },
                    )
                })
                .collect(),
            rejected: self
                .rejected
                .iter()
                .map(|item| (item.key().clone(), item.value().clone()))
                .collect(),
        };

        let result = serde_json::to_vec_pretty(&file)
            .context("failed to serialize cache")
            .and_then(|bytes| paths::write_atomic(path, &bytes));
        match result {
            Ok(()) => {
                debug!("flushed {} cache entries to {}", self.len(), path.display());
                Ok(())
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.degrade(format!("failed to write cache {}: {:#}", path.display(), err));
                Err(err)
            }
        }
    }

    fn degrade(&self, message: String) {
        warn!("{}; continuing with an in-memory cache", message);
        self.persistent.store(false, Ordering::SeqCst);
        self.push_warning(message);
    }

    fn push_warning(&self, message: String) {
        let mut warnings = self
            .warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        warnings.push(message);
    }
}

pub fn cache_path_for_input(cache_dir: &Path, input: &Path) -> PathBuf {
    let resolved = fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
    let digest = md5::compute(resolved.to_string_lossy().as_bytes());
    cache_dir.join(format!("cache_{:x}.json", digest))
}

fn move_aside(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".bad-{}", stamp));
    let target = PathBuf::from(name);
    fs::rename(path, &target)?;
    Ok(target)
}
