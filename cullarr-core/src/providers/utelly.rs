//! Utelly (RapidAPI) client, the last-resort series-level source.
//!
//! Utelly's free tier is metered per month, so the orchestrator only reaches
//! it after TMDB and Streaming Availability both fail to answer. Responses
//! carry no season detail.

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

pub const UTELLY_PROVIDER_ID: &str = "utelly";

const RAPIDAPI_HOST: &str = "utelly-tv-shows-and-movies-availability-v1.p.rapidapi.com";

/// Utelly API client.
#[derive(Debug)]
pub struct UtellyProvider {
    client: reqwest::Client,
    base_url: String,
    rapidapi_key: String,
    rapidapi_host: String,
    cache_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    results: Vec<LookupResult>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(default)]
    display_name: String,
}

impl UtellyProvider {
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
}

#[async_trait]
impl AvailabilityProvider for UtellyProvider {
    fn id(&self) -> &str {
        UTELLY_PROVIDER_ID
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

        let url = format!("{}/lookup", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("term", imdb_id), ("country", country_code.as_str())])
            .header("X-RapidAPI-Key", &self.rapidapi_key)
            .header("X-RapidAPI-Host", &self.rapidapi_host)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let lookup: LookupResponse = match response.status() {
            status if status.is_success() => {
                response.json().await.map_err(|err| FetchError::Fatal {
                    reason: format!("unexpected Utelly response shape: {err}"),
                })?
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(FetchError::Fatal {
                    reason: "Utelly authentication failed, check the RapidAPI key".to_string(),
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
                    reason: format!("Utelly server error: HTTP {status}"),
                });
            }
            status => {
                return Err(FetchError::Fatal {
                    reason: format!("Utelly API error: HTTP {status}"),
                });
            }
        };

        let services: BTreeSet<String> = lookup
            .results
            .iter()
            .flat_map(|result| result.locations.iter())
            .map(|location| normalize_provider_name(&location.display_name))
            .filter(|name| !name.is_empty())
            .collect();

        if services.is_empty() {
            return Err(FetchError::NotFound);
        }
        debug!(imdb_id, country = %country_code, services = services.len(), "utelly answer");

        Ok(ProviderAvailability {
            source_id: UTELLY_PROVIDER_ID.to_string(),
            country: country_code.to_ascii_uppercase(),
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
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider_for(server: &MockServer) -> UtellyProvider {
        UtellyProvider::with_config(
            server.uri(),
            "rapid-key".to_string(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_lookup_extracts_locations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lookup"))
            .and(query_param("term", "tt0903747"))
            .and(query_param("country", "de"))
            .and(header("X-RapidAPI-Host", RAPIDAPI_HOST))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "locations": [
                        {"display_name": "Netflix"},
                        {"display_name": "Amazon Prime Video"}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let availability = provider.fetch_availability("tt0903747", "DE").await.unwrap();

        assert_eq!(availability.granularity, Granularity::SeriesLevel);
        assert_eq!(availability.country, "DE");
        assert!(availability.has_service("netflix"));
        assert!(availability.has_service("amazon-prime"));
    }

    #[tokio::test]
    async fn test_empty_results_are_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
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
    async fn test_spent_plan_quota_maps_to_quota_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .fetch_availability("tt0903747", "DE")
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
            .fetch_availability("tt0903747", "DE")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited));
    }
}
