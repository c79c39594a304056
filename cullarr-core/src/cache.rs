//! Durable TTL cache for provider responses.
//!
//! One JSON file per entry under a cache directory. Keys are composed by the
//! caller from (provider id, content id, country); the cache itself has no
//! cross-provider semantics. Expired entries count as misses and are removed
//! lazily on read, so no background sweep is needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to create or access the cache directory.
    #[error("Failed to create cache directory at {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write an entry file.
    #[error("Failed to write cache entry {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize a payload for caching.
    #[error("Failed to serialize cache payload: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Composite cache key: provider, content external-id, country.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider_id: String,
    pub content_id: String,
    pub country: String,
}

impl CacheKey {
    pub fn new(
        provider_id: impl Into<String>,
        content_id: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            content_id: content_id.into(),
            country: country.into(),
        }
    }

    /// Filesystem-safe file stem for this key.
    fn file_stem(&self) -> String {
        sanitize(&format!(
            "{}_{}_{}",
            self.provider_id, self.content_id, self.country
        ))
    }
}

/// Envelope stored on disk around each payload.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    payload: T,
    created_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl<T> Envelope<T> {
    /// Compares at millisecond precision so a freshly-expired entry is not
    /// served for up to a second past its deadline.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = now.signed_duration_since(self.created_at).num_milliseconds();
        let ttl_ms = self
            .ttl_seconds
            .saturating_mul(1000)
            .min(i64::MAX as u64) as i64;
        age_ms < 0 || age_ms > ttl_ms
    }
}

/// Durable TTL key/value store for provider availability payloads.
///
/// Reads are safe from concurrent tasks; writes are atomic per key via a
/// temp-file rename, last writer wins.
#[derive(Debug)]
pub struct ProviderCache {
    cache_dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Counters surfaced by the `check` command.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub cache_dir: PathBuf,
}

impl ProviderCache {
    /// Opens (creating if needed) a cache rooted at the given directory.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|source| {
            CacheError::DirectoryCreationFailed {
                path: cache_dir.clone(),
                source,
            }
        })?;
        Ok(Self {
            cache_dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Looks up a payload. Expired or unreadable entries are misses; an
    /// expired file is deleted on the way out.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let path = self.entry_path(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let envelope: Envelope<T> = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A corrupt entry is recoverable state, not an error: drop it.
                warn!(path = %path.display(), %err, "discarding unreadable cache entry");
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if envelope.is_expired(Utc::now()) {
            debug!(key = %path.display(), "cache entry expired");
            let _ = std::fs::remove_file(&path);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(envelope.payload)
    }

    /// Stores a payload under the key, restarting its TTL window from now.
    pub fn put<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let envelope = Envelope {
            payload,
            created_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| CacheError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| CacheError::WriteFailed { path, source })
    }

    /// Removes an entry if present.
    pub fn invalidate(&self, key: &CacheKey) {
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    pub fn statistics(&self) -> CacheStatistics {
        let entries = std::fs::read_dir(&self.cache_dir)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count() as u64
            })
            .unwrap_or(0);
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            cache_dir: self.cache_dir.clone(),
        }
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.file_stem()))
    }
}

/// Lowercases and replaces anything outside `[a-z0-9-_]` with underscores.
fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns the default state directory (cache, quota state) for this system.
pub fn default_state_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "cullarr", "cullarr")
        .map(|dirs| dirs.cache_dir().to_path_buf())
}
