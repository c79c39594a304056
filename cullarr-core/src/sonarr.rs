//! Sonarr library-manager client.
//!
//! The sync engine only needs two things from the library manager: the list
//! of monitored series and a way to apply an action to one of them. Both sit
//! behind [`LibraryManager`] so tests and dry runs can swap in a scripted
//! implementation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::resolver::Action;

/// Errors from the library manager boundary.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// The manager could not be reached at all. Run-fatal when listing.
    #[error("library manager unreachable: {reason}")]
    Unreachable { reason: String },

    /// The manager rejected the API key.
    #[error("library manager rejected the API key")]
    Unauthorized,

    /// The series no longer exists in the manager.
    #[error("series {series_id} not found in library manager")]
    NotFound { series_id: i64 },

    /// Any other API-level failure.
    #[error("library manager API error: {reason}")]
    Api { reason: String },
}

/// One monitored series as the sync engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub id: i64,
    pub title: String,
    pub imdb_id: Option<String>,
    /// Season numbers currently monitored, specials included if monitored.
    pub monitored_seasons: BTreeSet<u32>,
    /// When the series was added to the library.
    pub added: Option<DateTime<Utc>>,
}

/// The external system that owns the series catalog.
#[async_trait]
pub trait LibraryManager: Send + Sync + std::fmt::Debug {
    /// All series currently monitored, in the manager's order.
    async fn list_monitored_series(&self) -> Result<Vec<Series>, LibraryError>;

    /// Applies an action to one series.
    ///
    /// # Errors
    /// - `LibraryError::NotFound` - Series vanished since listing
    /// - `LibraryError::Unreachable` - Network failure after one retry
    async fn apply_action(&self, series_id: i64, action: Action) -> Result<(), LibraryError>;

    /// Verifies the manager is reachable and the credentials work.
    async fn test_connection(&self) -> Result<(), LibraryError>;
}

/// Sonarr v3 API client.
#[derive(Debug)]
pub struct SonarrClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SeriesResource {
    id: i64,
    title: String,
    #[serde(default, rename = "imdbId")]
    imdb_id: Option<String>,
    #[serde(default)]
    monitored: bool,
    #[serde(default)]
    added: Option<DateTime<Utc>>,
    #[serde(default)]
    seasons: Vec<SeasonResource>,
}

#[derive(Debug, Deserialize)]
struct SeasonResource {
    #[serde(rename = "seasonNumber")]
    season_number: u32,
    #[serde(default)]
    monitored: bool,
}

impl SonarrClient {
    pub fn new(base_url: Url, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, LibraryError> {
        self.base_url
            .join(&format!("api/v3/{path}"))
            .map_err(|err| LibraryError::Api {
                reason: format!("invalid endpoint path '{path}': {err}"),
            })
    }

    /// Sends a request, retrying once on connection-level failure.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, LibraryError> {
        let build = |r: reqwest::RequestBuilder| r.header("X-Api-Key", &self.api_key);
        let cloned = request.try_clone();

        match build(request).send().await {
            Ok(response) => Ok(response),
            Err(first) => {
                let Some(retry) = cloned else {
                    return Err(LibraryError::Unreachable {
                        reason: first.to_string(),
                    });
                };
                debug!(error = %first, "library manager request failed, retrying once");
                build(retry).send().await.map_err(|err| LibraryError::Unreachable {
                    reason: err.to_string(),
                })
            }
        }
    }

    fn check_status(
        response: &reqwest::Response,
        series_id: Option<i64>,
    ) -> Result<(), LibraryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(LibraryError::Unauthorized)
            }
            reqwest::StatusCode::NOT_FOUND => match series_id {
                Some(series_id) => Err(LibraryError::NotFound { series_id }),
                None => Err(LibraryError::Api {
                    reason: "HTTP 404".to_string(),
                }),
            },
            status => Err(LibraryError::Api {
                reason: format!("HTTP {status}"),
            }),
        }
    }

    async fn fetch_series_document(&self, series_id: i64) -> Result<serde_json::Value, LibraryError> {
        let url = self.endpoint(&format!("series/{series_id}"))?;
        let response = self.send(self.client.get(url)).await?;
        Self::check_status(&response, Some(series_id))?;
        response.json().await.map_err(|err| LibraryError::Api {
            reason: format!("unreadable series document: {err}"),
        })
    }

    /// Flips monitoring off for the series and every season, preserving the
    /// rest of the document Sonarr expects back on PUT.
    async fn unmonitor(&self, series_id: i64) -> Result<(), LibraryError> {
        let mut document = self.fetch_series_document(series_id).await?;
        if !document.is_object() {
            return Err(LibraryError::Api {
                reason: "series document is not a JSON object".to_string(),
            });
        }

        document["monitored"] = serde_json::Value::Bool(false);
        if let Some(seasons) = document["seasons"].as_array_mut() {
            for season in seasons {
                season["monitored"] = serde_json::Value::Bool(false);
            }
        }

        let url = self.endpoint(&format!("series/{series_id}"))?;
        let response = self.send(self.client.put(url).json(&document)).await?;
        Self::check_status(&response, Some(series_id))?;
        info!(series_id, "unmonitored series");
        Ok(())
    }

    /// Removes the series from Sonarr. Files stay on disk; Sonarr simply
    /// stops tracking them.
    async fn delete(&self, series_id: i64) -> Result<(), LibraryError> {
        let url = self.endpoint(&format!("series/{series_id}"))?;
        let response = self
            .send(self.client.delete(url).query(&[("deleteFiles", "false")]))
            .await?;
        Self::check_status(&response, Some(series_id))?;
        info!(series_id, "deleted series from library manager");
        Ok(())
    }
}

#[async_trait]
impl LibraryManager for SonarrClient {
    async fn list_monitored_series(&self) -> Result<Vec<Series>, LibraryError> {
        let url = self.endpoint("series")?;
        let response = self.send(self.client.get(url)).await?;
        Self::check_status(&response, None)?;

        let resources: Vec<SeriesResource> =
            response.json().await.map_err(|err| LibraryError::Api {
                reason: format!("unreadable series list: {err}"),
            })?;

        let series: Vec<Series> = resources
            .into_iter()
            .filter(|resource| resource.monitored)
            .map(|resource| Series {
                id: resource.id,
                title: resource.title,
                imdb_id: resource.imdb_id.filter(|id| !id.is_empty()),
                monitored_seasons: resource
                    .seasons
                    .iter()
                    .filter(|season| season.monitored)
                    .map(|season| season.season_number)
                    .collect(),
                added: resource.added,
            })
            .collect();
        debug!(count = series.len(), "listed monitored series");
        Ok(series)
    }

    async fn apply_action(&self, series_id: i64, action: Action) -> Result<(), LibraryError> {
        match action {
            Action::Unmonitor => self.unmonitor(series_id).await,
            Action::Delete => self.delete(series_id).await,
        }
    }

    async fn test_connection(&self) -> Result<(), LibraryError> {
        let url = self.endpoint("system/status")?;
        let response = self.send(self.client.get(url)).await?;
        Self::check_status(&response, None)
    }
}

/// Scripted library manager for sync-engine tests.
#[derive(Debug, Default)]
pub struct MockLibrary {
    series: Vec<Series>,
    fail_apply_for: BTreeSet<i64>,
    applied: parking_lot::Mutex<Vec<(i64, Action)>>,
}

impl MockLibrary {
    pub fn new(series: Vec<Series>) -> Self {
        Self {
            series,
            fail_apply_for: BTreeSet::new(),
            applied: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Makes `apply_action` fail with `NotFound` for the given series.
    pub fn fail_apply_for(mut self, series_id: i64) -> Self {
        self.fail_apply_for.insert(series_id);
        self
    }

    /// Actions applied so far, in call order.
    pub fn applied(&self) -> Vec<(i64, Action)> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl LibraryManager for MockLibrary {
    async fn list_monitored_series(&self) -> Result<Vec<Series>, LibraryError> {
        Ok(self.series.clone())
    }

    async fn apply_action(&self, series_id: i64, action: Action) -> Result<(), LibraryError> {
        if self.fail_apply_for.contains(&series_id) {
            return Err(LibraryError::NotFound { series_id });
        }
        self.applied.lock().push((series_id, action));
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), LibraryError> {
        Ok(())
    }
}
