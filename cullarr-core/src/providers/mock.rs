//! Scriptable provider for orchestrator and sync tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{AvailabilityProvider, FetchError, Granularity, ProviderAvailability};

/// One scripted outcome for a [`MockProvider`] call.
#[derive(Debug)]
pub enum MockOutcome {
    Success(ProviderAvailability),
    NotFound,
    RateLimited,
    QuotaExhausted,
    Transient,
    Fatal,
}

impl MockOutcome {
    fn into_result(self) -> Result<ProviderAvailability, FetchError> {
        match self {
            MockOutcome::Success(availability) => Ok(availability),
            MockOutcome::NotFound => Err(FetchError::NotFound),
            MockOutcome::RateLimited => Err(FetchError::RateLimited),
            MockOutcome::QuotaExhausted => Err(FetchError::QuotaExhausted),
            MockOutcome::Transient => Err(FetchError::Transient {
                reason: "scripted transient failure".to_string(),
            }),
            MockOutcome::Fatal => Err(FetchError::Fatal {
                reason: "scripted fatal failure".to_string(),
            }),
        }
    }
}

/// Provider that replays a scripted queue of outcomes.
///
/// When the queue runs dry every further call answers `NotFound`. Call counts
/// let tests assert how often the orchestrator actually reached the source.
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    cache_ttl: Duration,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cache_ttl: Duration::from_secs(3600),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn push_success(&self, availability: ProviderAvailability) {
        self.push(MockOutcome::Success(availability));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AvailabilityProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    async fn fetch_availability(
        &self,
        _imdb_id: &str,
        _country: &str,
    ) -> Result<ProviderAvailability, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(outcome) => outcome.into_result(),
            None => Err(FetchError::NotFound),
        }
    }
}

/// Series-level answer with the given services.
pub fn series_level(source_id: &str, country: &str, services: &[&str]) -> ProviderAvailability {
    ProviderAvailability {
        source_id: source_id.to_string(),
        country: country.to_string(),
        granularity: Granularity::SeriesLevel,
        services: services.iter().map(|s| s.to_string()).collect(),
        seasons_by_service: BTreeMap::new(),
        fetched_at: Utc::now(),
    }
}

/// Season-level answer listing which seasons each service carries.
pub fn season_level(
    source_id: &str,
    country: &str,
    seasons: &[(&str, &[u32])],
) -> ProviderAvailability {
    let seasons_by_service: BTreeMap<String, BTreeSet<u32>> = seasons
        .iter()
        .map(|(service, numbers)| (service.to_string(), numbers.iter().copied().collect()))
        .collect();
    ProviderAvailability {
        source_id: source_id.to_string(),
        country: country.to_string(),
        granularity: Granularity::SeasonLevel,
        services: seasons_by_service.keys().cloned().collect(),
        seasons_by_service,
        fetched_at: Utc::now(),
    }
}
