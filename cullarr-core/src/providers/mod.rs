//! Availability data source clients.
//!
//! Each external API (TMDB, Streaming Availability, Utelly) implements
//! [`AvailabilityProvider`]. The orchestrator in `fallback` walks them in
//! priority order; individual clients know nothing about caching or quotas.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;
pub mod streaming_availability;
pub mod tmdb;
pub mod utelly;

pub use streaming_availability::StreamingAvailabilityProvider;
pub use tmdb::TmdbProvider;
pub use utelly::UtellyProvider;

/// How precise a provider's answer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    /// The source only says "this series is on service X".
    SeriesLevel,
    /// The source lists which seasons service X carries.
    SeasonLevel,
}

/// One data source's answer for a title in one country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAvailability {
    /// Canonical id of the data source that produced this answer.
    pub source_id: String,
    /// Two-letter country code the answer applies to.
    pub country: String,
    pub granularity: Granularity,
    /// Canonical streaming-service ids the title is available on.
    pub services: BTreeSet<String>,
    /// For season-level answers: seasons each service carries. A service
    /// present in `services` but absent here is series-level for that entry.
    pub seasons_by_service: std::collections::BTreeMap<String, BTreeSet<u32>>,
    pub fetched_at: DateTime<Utc>,
}

impl ProviderAvailability {
    /// Seasons reported for a service, if the answer is season-granular
    /// for that service.
    pub fn seasons_for(&self, service: &str) -> Option<&BTreeSet<u32>> {
        self.seasons_by_service.get(service)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }
}

/// Tagged outcome of one provider call. Retry decisions live in the
/// orchestrator's loop, not in unwinding.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Content unknown to this source; fall through to the next one.
    #[error("content not found on provider")]
    NotFound,

    /// The remote signaled throttling (HTTP 429); worth a bounded retry
    /// after backing off.
    #[error("provider signaled rate limiting")]
    RateLimited,

    /// The remote reports its hard quota for the current window is spent
    /// (e.g. a RapidAPI 403); disable the source until the window rolls over.
    #[error("provider quota exhausted")]
    QuotaExhausted,

    /// Network failure or 5xx; worth a bounded retry.
    #[error("transient provider error: {reason}")]
    Transient { reason: String },

    /// Bad credentials or schema mismatch; disable the source for the run.
    #[error("fatal provider error: {reason}")]
    Fatal { reason: String },
}

impl FetchError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        FetchError::Transient {
            reason: err.to_string(),
        }
    }
}

/// A queryable availability data source.
#[async_trait]
pub trait AvailabilityProvider: Send + Sync + std::fmt::Debug {
    /// Canonical id used for cache keys, quota tracking, and logs.
    fn id(&self) -> &str;

    /// How long successful answers from this source stay fresh.
    fn cache_ttl(&self) -> Duration;

    /// Fetches raw availability for a title (by IMDb id) in one country.
    ///
    /// # Errors
    /// - `FetchError::NotFound` - Source has no record of the title
    /// - `FetchError::RateLimited` - Source throttled the request
    /// - `FetchError::QuotaExhausted` - Source's plan quota is spent
    /// - `FetchError::Transient` - Network or server failure
    /// - `FetchError::Fatal` - Credentials or schema problem
    async fn fetch_availability(
        &self,
        imdb_id: &str,
        country: &str,
    ) -> Result<ProviderAvailability, FetchError>;
}

/// Validates the `tt0000000`-style IMDb id format shared by all sources.
pub(crate) fn validate_imdb_id(imdb_id: &str) -> Result<(), FetchError> {
    let digits = imdb_id.strip_prefix("tt").unwrap_or("");
    if digits.len() >= 7 && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(FetchError::Fatal {
            reason: format!("invalid IMDb id: '{imdb_id}' (expected tt followed by digits)"),
        })
    }
}
