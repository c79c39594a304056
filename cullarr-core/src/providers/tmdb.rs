//! TMDB watch-provider client, the primary (free, generously limited) source.
//!
//! Availability is a two-step lookup: resolve the IMDb id to a TMDB series id
//! via `/find`, then read `/tv/{id}/watch/providers`. Id mappings never
//! change, so they are cached near-permanently when an id cache is attached.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{
    AvailabilityProvider, FetchError, Granularity, ProviderAvailability, validate_imdb_id,
};
use crate::cache::{CacheKey, ProviderCache};
use crate::normalize::normalize_provider_name;

pub const TMDB_PROVIDER_ID: &str = "tmdb";

/// Id mappings effectively never expire.
const ID_MAPPING_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// TMDB API client.
#[derive(Debug)]
pub struct TmdbProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache_ttl: Duration,
    /// Optional durable store for IMDb -> TMDB id mappings.
    id_cache: Option<Arc<ProviderCache>>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    tv_results: Vec<FindResult>,
}

#[derive(Debug, Deserialize)]
struct FindResult {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WatchProvidersResponse {
    #[serde(default)]
    results: HashMap<String, CountryProviders>,
}

#[derive(Debug, Default, Deserialize)]
struct CountryProviders {
    #[serde(default)]
    flatrate: Vec<WatchEntry>,
    #[serde(default)]
    free: Vec<WatchEntry>,
    #[serde(default)]
    ads: Vec<WatchEntry>,
}

#[derive(Debug, Deserialize)]
struct WatchEntry {
    provider_name: String,
}

impl TmdbProvider {
    pub fn new(api_key: String, cache_ttl: Duration) -> Self {
        Self::with_config("https://api.themoviedb.org/3".to_string(), api_key, cache_ttl)
    }

    /// Creates a client against a custom base URL (used by tests).
    pub fn with_config(base_url: String, api_key: String, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            cache_ttl,
            id_cache: None,
        }
    }

    /// Attaches a durable cache for IMDb -> TMDB id mappings.
    pub fn with_id_cache(mut self, cache: Arc<ProviderCache>) -> Self {
        self.id_cache = Some(cache);
        self
    }

    /// v4 credentials are JWTs sent as a Bearer header; v3 keys go in the
    /// query string.
    fn uses_bearer_auth(&self) -> bool {
        self.api_key.starts_with("eyJ")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.client.get(&url).query(query);
        if self.uses_bearer_auth() {
            request = request.bearer_auth(&self.api_key);
        } else {
            request = request.query(&[("api_key", self.api_key.as_str())]);
        }

        let response = request.send().await.map_err(FetchError::from_reqwest)?;
        match response.status() {
            status if status.is_success() => {
                response.json::<T>().await.map_err(|err| FetchError::Fatal {
                    reason: format!("unexpected TMDB response shape: {err}"),
                })
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(FetchError::Fatal {
                reason: "TMDB authentication failed, check the API key".to_string(),
            }),
            reqwest::StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited),
            status if status.is_server_error() => Err(FetchError::Transient {
                reason: format!("TMDB server error: HTTP {status}"),
            }),
            status => Err(FetchError::Fatal {
                reason: format!("TMDB API error: HTTP {status}"),
            }),
        }
    }

    /// Resolves the TMDB series id for an IMDb id, through the id cache when
    /// one is attached.
    async fn resolve_series_id(&self, imdb_id: &str) -> Result<i64, FetchError> {
        let key = CacheKey::new("tmdb-id", imdb_id, "any");
        if let Some(cache) = &self.id_cache {
            if let Some(id) = cache.get::<i64>(&key) {
                debug!(imdb_id, tmdb_id = id, "id mapping cache hit");
                return Ok(id);
            }
        }

        let response: FindResponse = self
            .get_json(
                &format!("find/{imdb_id}"),
                &[("external_source", "imdb_id")],
            )
            .await?;
        let id = response
            .tv_results
            .first()
            .map(|r| r.id)
            .ok_or(FetchError::NotFound)?;

        if let Some(cache) = &self.id_cache {
            // Losing a mapping write just costs one extra lookup later.
            let _ = cache.put(&key, &id, ID_MAPPING_TTL);
        }
        debug!(imdb_id, tmdb_id = id, "resolved TMDB series id");
        Ok(id)
    }
}

#[async_trait]
impl AvailabilityProvider for TmdbProvider {
    fn id(&self) -> &str {
        TMDB_PROVIDER_ID
    }

    fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    async fn fetch_availability(
        &self,
        imdb_id: &str,
        country: &str,
    ) -> Result<ProviderAvailability, FetchError> {
        validate_imdb_id(imdb_id)?;

        let tmdb_id = self.resolve_series_id(imdb_id).await?;
        let response: WatchProvidersResponse = self
            .get_json(&format!("tv/{tmdb_id}/watch/providers"), &[])
            .await?;

        let country_code = country.to_ascii_uppercase();
        let Some(entry) = response.results.get(&country_code) else {
            // No data for the requested country reads the same as an unknown
            // title: let the orchestrator fall through to the next source.
            return Err(FetchError::NotFound);
        };

        let services: BTreeSet<String> = entry
            .flatrate
            .iter()
            .chain(entry.free.iter())
            .chain(entry.ads.iter())
            .map(|watch| normalize_provider_name(&watch.provider_name))
            .filter(|name| !name.is_empty())
            .collect();

        if services.is_empty() {
            return Err(FetchError::NotFound);
        }

        Ok(ProviderAvailability {
            source_id: TMDB_PROVIDER_ID.to_string(),
            country: country_code,
            granularity: Granularity::SeriesLevel,
            services,
            seasons_by_service: BTreeMap::new(),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider_for(server: &MockServer) -> TmdbProvider {
        TmdbProvider::with_config(
            server.uri(),
            "test-key".to_string(),
            Duration::from_secs(3600),
        )
    }

    async fn mount_find(server: &MockServer, imdb_id: &str, tmdb_id: i64) {
        Mock::given(method("GET"))
            .and(path(format!("/find/{imdb_id}")))
            .and(query_param("external_source", "imdb_id"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({
                    "tv_results": [{"id": tmdb_id}]
                })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fetch_availability_series_level() {
        let server = MockServer::start().await;
        mount_find(&server, "tt0903747", 1396).await;
        Mock::given(method("GET"))
            .and(path("/tv/1396/watch/providers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": {
                    "US": {
                        "flatrate": [{"provider_name": "Netflix"}],
                        "ads": [{"provider_name": "Amazon Prime Video"}]
                    }
                }
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let availability = provider.fetch_availability("tt0903747", "us").await.unwrap();

        assert_eq!(availability.source_id, "tmdb");
        assert_eq!(availability.country, "US");
        assert_eq!(availability.granularity, Granularity::SeriesLevel);
        assert!(availability.has_service("netflix"));
        assert!(availability.has_service("amazon-prime"));
    }

    #[tokio::test]
    async fn test_unknown_title_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/find/tt0000001"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"tv_results": []})),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0000001", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_country_without_data_is_not_found() {
        let server = MockServer::start().await;
        mount_find(&server, "tt0903747", 1396).await;
        Mock::given(method("GET"))
            .and(path("/tv/1396/watch/providers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": {"US": {"flatrate": [{"provider_name": "Netflix"}]}}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "DE")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_throttling_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_id_cache_skips_second_find_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/find/tt0903747"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"tv_results": [{"id": 1396}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tv/1396/watch/providers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": {"US": {"flatrate": [{"provider_name": "Netflix"}]}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ProviderCache::open(dir.path().join("ids")).unwrap());
        let provider = provider_for(&server).with_id_cache(cache);

        provider.fetch_availability("tt0903747", "US").await.unwrap();
        provider.fetch_availability("tt0903747", "US").await.unwrap();
    }
}
