//! Streaming Availability (RapidAPI) client, the only season-granular source.
//!
//! The API is metered per day, so this client sits behind the TMDB source in
//! fallback order and its daily quota is enforced by the rate limiter, not
//! here. HTTP 403 from RapidAPI means the subscription quota is spent and is
//! reported as quota exhaustion so the orchestrator sidelines the source.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{
    AvailabilityProvider, FetchError, Granularity, ProviderAvailability, validate_imdb_id,
};
use crate::normalize::normalize_provider_name;

pub const STREAMING_AVAILABILITY_PROVIDER_ID: &str = "streaming-availability";

const RAPIDAPI_HOST: &str = "streaming-availability.p.rapidapi.com";

/// Streaming Availability API client.
#[derive(Debug)]
pub struct StreamingAvailabilityProvider {
    client: reqwest::Client,
    base_url: String,
    rapidapi_key: String,
    rapidapi_host: String,
    cache_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    /// Streaming options keyed by lowercase country code.
    #[serde(default, rename = "streamingOptions")]
    streaming_options: BTreeMap<String, Vec<StreamingOption>>,
    #[serde(default)]
    seasons: Vec<SeasonEntry>,
}

#[derive(Debug, Deserialize)]
struct SeasonEntry {
    #[serde(default, rename = "seasonNumber")]
    season_number: Option<u32>,
    #[serde(default, rename = "streamingOptions")]
    streaming_options: BTreeMap<String, Vec<StreamingOption>>,
}

#[derive(Debug, Deserialize)]
struct StreamingOption {
    service: ServiceRef,
    /// Monetization: "subscription", "free", "rent", "buy", "addon".
    #[serde(default, rename = "type")]
    option_type: String,
}

#[derive(Debug, Deserialize)]
struct ServiceRef {
    id: String,
}

impl StreamingAvailabilityProvider {
    pub fn new(rapidapi_key: String, cache_ttl: Duration) -> Self {
        Self::with_config(
            format!("https://{RAPIDAPI_HOST}"),
            rapidapi_key,
            cache_ttl,
        )
    }

    /// Creates a client against a custom base URL (used by tests).
    pub fn with_config(base_url: String, rapidapi_key: String, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            rapidapi_key,
            rapidapi_host: RAPIDAPI_HOST.to_string(),
            cache_ttl,
        }
    }

    /// Only no-extra-cost monetization counts as available.
    fn is_included(option: &StreamingOption) -> bool {
        matches!(option.option_type.as_str(), "subscription" | "free" | "")
    }

    fn services_in(options: &[StreamingOption]) -> BTreeSet<String> {
        options
            .iter()
            .filter(|option| Self::is_included(option))
            .map(|option| normalize_provider_name(&option.service.id))
            .filter(|name| !name.is_empty())
            .collect()
    }
}

#[async_trait]
impl AvailabilityProvider for StreamingAvailabilityProvider {
    fn id(&self) -> &str {
        STREAMING_AVAILABILITY_PROVIDER_ID
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
        let country_code = country.to_ascii_lowercase();

        let url = format!("{}/shows/{imdb_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("country", country_code.as_str())])
            .header("X-RapidAPI-Key", &self.rapidapi_key)
            .header("X-RapidAPI-Host", &self.rapidapi_host)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let show: ShowResponse = match response.status() {
            status if status.is_success() => {
                response
                    .json()
                    .await
                    .map_err(|err| FetchError::Fatal {
                        reason: format!("unexpected Streaming Availability response shape: {err}"),
                    })?
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(FetchError::Fatal {
                    reason: "Streaming Availability authentication failed, check the RapidAPI key"
                        .to_string(),
                });
            }
            // RapidAPI answers 403 when the plan's quota is spent.
            reqwest::StatusCode::FORBIDDEN => {
                return Err(FetchError::QuotaExhausted);
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::RateLimited);
            }
            reqwest::StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            status if status.is_server_error() => {
                return Err(FetchError::Transient {
                    reason: format!("Streaming Availability server error: HTTP {status}"),
                });
            }
            status => {
                return Err(FetchError::Fatal {
                    reason: format!("Streaming Availability API error: HTTP {status}"),
                });
            }
        };

        let mut services = Self::services_in(
            show.streaming_options
                .get(&country_code)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        );

        // Season entries upgrade the answer to season granularity.
        let mut seasons_by_service: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for (index, season) in show.seasons.iter().enumerate() {
            let number = season.season_number.unwrap_or(index as u32 + 1);
            let options = season
                .streaming_options
                .get(&country_code)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for service in Self::services_in(options) {
                seasons_by_service
                    .entry(service.clone())
                    .or_default()
                    .insert(number);
                services.insert(service);
            }
        }

        if services.is_empty() {
            return Err(FetchError::NotFound);
        }

        let granularity = if seasons_by_service.is_empty() {
            Granularity::SeriesLevel
        } else {
            Granularity::SeasonLevel
        };
        debug!(
            imdb_id,
            country = %country_code,
            services = services.len(),
            ?granularity,
            "streaming availability answer"
        );

        Ok(ProviderAvailability {
            source_id: STREAMING_AVAILABILITY_PROVIDER_ID.to_string(),
            country: country_code.to_ascii_uppercase(),
            granularity,
            services,
            seasons_by_service,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider_for(server: &MockServer) -> StreamingAvailabilityProvider {
        StreamingAvailabilityProvider::with_config(
            server.uri(),
            "rapid-key".to_string(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_season_level_answer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shows/tt0903747"))
            .and(query_param("country", "us"))
            .and(header("X-RapidAPI-Key", "rapid-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "streamingOptions": {
                    "us": [{"service": {"id": "netflix"}, "type": "subscription"}]
                },
                "seasons": [
                    {
                        "seasonNumber": 1,
                        "streamingOptions": {
                            "us": [{"service": {"id": "netflix"}, "type": "subscription"}]
                        }
                    },
                    {
                        "seasonNumber": 2,
                        "streamingOptions": {
                            "us": [{"service": {"id": "netflix"}, "type": "subscription"}]
                        }
                    }
                ]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let availability = provider.fetch_availability("tt0903747", "US").await.unwrap();

        assert_eq!(availability.granularity, Granularity::SeasonLevel);
        assert_eq!(
            availability.seasons_for("netflix"),
            Some(&BTreeSet::from([1, 2]))
        );
    }

    #[tokio::test]
    async fn test_series_level_when_no_season_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shows/tt0903747"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "streamingOptions": {
                    "de": [
                        {"service": {"id": "prime"}, "type": "subscription"},
                        {"service": {"id": "netflix"}, "type": "rent"}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let availability = provider.fetch_availability("tt0903747", "de").await.unwrap();

        assert_eq!(availability.granularity, Granularity::SeriesLevel);
        assert!(availability.has_service("amazon-prime"));
        // Rentals are not included availability.
        assert!(!availability.has_service("netflix"));
    }

    #[tokio::test]
    async fn test_spent_plan_quota_maps_to_quota_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::QuotaExhausted));
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
    async fn test_unknown_title_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
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
    async fn test_no_options_for_country_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "streamingOptions": {}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "US")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
    }
}
