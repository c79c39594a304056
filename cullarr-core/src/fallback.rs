//! Provider fallback orchestration.
//!
//! Walks the configured data sources in priority order for each (title,
//! country) pair, consulting the durable cache and the per-provider rate
//! limiter before every network call. The first usable answer wins; sources
//! that report fatal errors or exhausted quotas are sidelined for the rest
//! of the run so later titles skip them without paying for the failure again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ProviderCache};
use crate::providers::{AvailabilityProvider, FetchError, ProviderAvailability};
use crate::ratelimit::{Acquire, RateLimiterSet};

/// Negative answers are cached briefly so one unknown title does not burn a
/// metered request on every retry within the same quarter hour.
const NEGATIVE_TTL: Duration = Duration::from_secs(15 * 60);

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Outcome of resolving one (title, country) pair across all sources.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A source produced availability data.
    Answer(ProviderAvailability),
    /// Every reachable source authoritatively knows nothing about the title.
    NotFound,
    /// No source could be consulted (all sidelined or failing).
    NoUsableSource,
}

/// Why a source was taken out of rotation for the rest of the run.
#[derive(Debug, Clone, Serialize)]
pub struct SidelinedSource {
    pub provider_id: String,
    pub reason: String,
}

/// On-disk cache payload: `None` records a not-found answer.
#[derive(Debug, Serialize, Deserialize)]
struct CachedAnswer(Option<ProviderAvailability>);

/// Queries sources in priority order with caching, throttling, and retries.
pub struct FallbackOrchestrator {
    sources: Vec<Arc<dyn AvailabilityProvider>>,
    limiters: Arc<RateLimiterSet>,
    cache: Arc<ProviderCache>,
    sidelined: Mutex<HashMap<String, String>>,
}

impl FallbackOrchestrator {
    /// `sources` is the priority order; index zero is asked first.
    pub fn new(
        sources: Vec<Arc<dyn AvailabilityProvider>>,
        limiters: Arc<RateLimiterSet>,
        cache: Arc<ProviderCache>,
    ) -> Self {
        Self {
            sources,
            limiters,
            cache,
            sidelined: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves availability for one title in one country.
    ///
    /// Cache hits (positive or negative) never touch the limiter. A source
    /// answering `NotFound` is final for that source; the walk continues to
    /// the next one. Throttling and transient failures get bounded retries
    /// with jittered backoff, then the source is skipped for this title only.
    pub async fn resolve(&self, imdb_id: &str, country: &str) -> Resolution {
        let mut any_not_found = false;

        for source in &self.sources {
            let source_id = source.id().to_string();
            if self.is_sidelined(&source_id) {
                continue;
            }

            let key = CacheKey::new(&source_id, imdb_id, country);
            if let Some(CachedAnswer(cached)) = self.cache.get(&key) {
                match cached {
                    Some(answer) => {
                        debug!(imdb_id, country, source = %source_id, "cache hit");
                        return Resolution::Answer(answer);
                    }
                    None => {
                        debug!(imdb_id, country, source = %source_id, "negative cache hit");
                        any_not_found = true;
                        continue;
                    }
                }
            }

            match self.query_source(source.as_ref(), &source_id, imdb_id, country).await {
                SourceOutcome::Answer(answer) => {
                    self.store(&key, Some(&answer), source.cache_ttl());
                    return Resolution::Answer(answer);
                }
                SourceOutcome::NotFound => {
                    self.store(&key, None, NEGATIVE_TTL);
                    any_not_found = true;
                }
                SourceOutcome::Unusable => {}
            }
        }

        if any_not_found {
            Resolution::NotFound
        } else {
            Resolution::NoUsableSource
        }
    }

    /// Sources sidelined so far this run, in id order.
    pub fn sidelined(&self) -> Vec<SidelinedSource> {
        let mut out: Vec<_> = self
            .sidelined
            .lock()
            .iter()
            .map(|(provider_id, reason)| SidelinedSource {
                provider_id: provider_id.clone(),
                reason: reason.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    async fn query_source(
        &self,
        source: &dyn AvailabilityProvider,
        source_id: &str,
        imdb_id: &str,
        country: &str,
    ) -> SourceOutcome {
        for attempt in 1..=MAX_ATTEMPTS {
            if !self.acquire_slot(source_id).await {
                return SourceOutcome::Unusable;
            }

            match source.fetch_availability(imdb_id, country).await {
                Ok(answer) => return SourceOutcome::Answer(answer),
                Err(FetchError::NotFound) => return SourceOutcome::NotFound,
                Err(FetchError::QuotaExhausted) => {
                    self.sideline(source_id, "remote reports quota exhausted");
                    return SourceOutcome::Unusable;
                }
                Err(FetchError::Fatal { reason }) => {
                    self.sideline(source_id, &reason);
                    return SourceOutcome::Unusable;
                }
                Err(err @ (FetchError::RateLimited | FetchError::Transient { .. })) => {
                    if attempt == MAX_ATTEMPTS {
                        warn!(
                            imdb_id,
                            source = source_id,
                            %err,
                            "giving up on source for this title"
                        );
                        return SourceOutcome::Unusable;
                    }
                    let backoff = backoff_with_jitter(attempt);
                    debug!(
                        imdb_id,
                        source = source_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %err,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        SourceOutcome::Unusable
    }

    /// Waits out the sliding window until a slot is granted. Hard-ceiling
    /// exhaustion sidelines the source. Sources without a registered limiter
    /// proceed unthrottled.
    async fn acquire_slot(&self, source_id: &str) -> bool {
        let Some(limiter) = self.limiters.get(source_id) else {
            return true;
        };
        loop {
            match limiter.acquire().await {
                Acquire::Granted => return true,
                Acquire::RetryAfter(_) => continue,
                Acquire::Exhausted(window) => {
                    self.sideline(source_id, &format!("{window} exhausted"));
                    return false;
                }
            }
        }
    }

    fn is_sidelined(&self, source_id: &str) -> bool {
        self.sidelined.lock().contains_key(source_id)
    }

    fn sideline(&self, source_id: &str, reason: &str) {
        let mut sidelined = self.sidelined.lock();
        if !sidelined.contains_key(source_id) {
            info!(source = source_id, reason, "sidelining source for this run");
            sidelined.insert(source_id.to_string(), reason.to_string());
        }
    }

    fn store(&self, key: &CacheKey, answer: Option<&ProviderAvailability>, ttl: Duration) {
        let payload = CachedAnswer(answer.cloned());
        if let Err(err) = self.cache.put(key, &payload, ttl) {
            // A failed cache write only costs a future re-fetch.
            warn!(%err, "failed to write cache entry");
        }
    }
}

impl std::fmt::Debug for FallbackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("sources", &self.sources.len())
            .field("sidelined", &self.sidelined.lock().len())
            .finish()
    }
}

enum SourceOutcome {
    Answer(ProviderAvailability),
    NotFound,
    Unusable,
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
    let jitter = rand::rng().random_range(0..100);
    base + Duration::from_millis(jitter)
}
