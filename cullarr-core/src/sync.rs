//! The per-series sync loop.
//!
//! Each series moves through a small pipeline: recency gate, availability
//! resolution across the configured targets, decision, then action (or
//! dry-run record). Series are processed with bounded concurrency but the
//! report always lists them in the library manager's order.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Target;
use crate::fallback::{FallbackOrchestrator, Resolution};
use crate::report::{Decision, MatchedProvider, SeriesResult, SyncReport};
use crate::resolver::{evaluate_target, Action, TargetVerdict};
use crate::sonarr::{LibraryError, LibraryManager, Series};

/// Run-fatal failures. Per-series failures never surface here; they are
/// recorded in the report instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not list series from the library manager: {0}")]
    ListFailed(#[from] LibraryError),

    #[error("no streaming provider targets configured")]
    NoTargets,
}

/// Sync run parameters, already validated by the config layer.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub targets: Vec<Target>,
    pub action: Action,
    pub dry_run: bool,
    pub exclude_recent_days: u32,
    pub concurrency: usize,
}

/// Drives one sync run end to end.
pub struct SyncEngine {
    orchestrator: Arc<FallbackOrchestrator>,
    library: Arc<dyn LibraryManager>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        orchestrator: Arc<FallbackOrchestrator>,
        library: Arc<dyn LibraryManager>,
        options: SyncOptions,
    ) -> Self {
        Self {
            orchestrator,
            library,
            options,
        }
    }

    /// Runs the full sync. Cancellation aborts availability resolution for
    /// undecided series; an action already dispatched to the library manager
    /// always runs to completion so the report matches what the manager did.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SyncReport, SyncError> {
        if self.options.targets.is_empty() {
            return Err(SyncError::NoTargets);
        }

        let series = self.library.list_monitored_series().await?;
        info!(
            count = series.len(),
            dry_run = self.options.dry_run,
            action = %self.options.action,
            "starting sync run"
        );

        let mut results: Vec<(usize, SeriesResult)> = stream::iter(
            series.into_iter().enumerate(),
        )
        .map(|(index, series)| {
            let cancel = cancel.clone();
            async move {
                // Only the decision phase is cancellable. Once a series
                // matches, the action must finish: dropping it mid-flight
                // could leave Sonarr changed while the report says otherwise.
                let decision = tokio::select! {
                    decision = self.decide_series(&series) => decision,
                    () = cancel.cancelled() => SeriesDecision::Settled(cancelled_result(&series)),
                };
                let result = match decision {
                    SeriesDecision::Settled(result) => result,
                    SeriesDecision::Matched { matched, reason } => {
                        self.act(&series, matched, reason).await
                    }
                };
                (index, result)
            }
        })
        .buffer_unordered(self.options.concurrency.max(1))
        .collect()
        .await;

        // Completion order back to input order.
        results.sort_by_key(|(index, _)| *index);
        let results: Vec<SeriesResult> = results.into_iter().map(|(_, result)| result).collect();

        Ok(SyncReport::new(
            self.options.dry_run,
            self.options.action,
            results,
            self.orchestrator.sidelined(),
        ))
    }

    async fn decide_series(&self, series: &Series) -> SeriesDecision {
        if let Some(result) = self.excluded_result(series) {
            return SeriesDecision::Settled(result);
        }
        let Some(imdb_id) = series.imdb_id.as_deref() else {
            debug!(title = %series.title, "series has no IMDb id");
            return SeriesDecision::Settled(none_result(
                series,
                "no IMDb id in the library manager",
            ));
        };

        match self.find_match(series, imdb_id).await {
            MatchOutcome::Matched { matched, reason } => {
                SeriesDecision::Matched { matched, reason }
            }
            MatchOutcome::NoMatch { reason } => SeriesDecision::Settled(none_result(series, &reason)),
        }
    }

    /// The recency gate: never act on freshly added series, whatever the
    /// sources say.
    fn excluded_result(&self, series: &Series) -> Option<SeriesResult> {
        if series.monitored_seasons.is_empty() {
            return Some(none_result(series, "no monitored seasons"));
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.options.exclude_recent_days));
        match series.added {
            Some(added) if added > cutoff => {
                debug!(title = %series.title, %added, "excluded as recently added");
                Some(none_result(
                    series,
                    &format!(
                        "added within the last {} days",
                        self.options.exclude_recent_days
                    ),
                ))
            }
            _ => None,
        }
    }

    /// Walks the configured targets in order; the first fully covered one
    /// wins. One availability resolution per country is reused across
    /// targets sharing that country.
    async fn find_match(&self, series: &Series, imdb_id: &str) -> MatchOutcome {
        let mut by_country: HashMap<String, Resolution> = HashMap::new();
        let mut partial: Option<(String, BTreeSet<u32>)> = None;
        let mut any_answer = false;
        let mut any_not_found = false;

        for target in &self.options.targets {
            let resolution = match by_country.get(&target.country) {
                Some(resolution) => resolution.clone(),
                None => {
                    let resolution = self.orchestrator.resolve(imdb_id, &target.country).await;
                    by_country.insert(target.country.clone(), resolution.clone());
                    resolution
                }
            };

            let availability = match &resolution {
                Resolution::Answer(availability) => {
                    any_answer = true;
                    availability
                }
                Resolution::NotFound => {
                    any_not_found = true;
                    continue;
                }
                Resolution::NoUsableSource => continue,
            };

            match evaluate_target(availability, &target.name, &series.monitored_seasons) {
                TargetVerdict::FullyAvailable { covered_seasons } => {
                    let detail = if covered_seasons.is_empty() {
                        "whole series".to_string()
                    } else {
                        format!("seasons {}", format_seasons(&covered_seasons))
                    };
                    return MatchOutcome::Matched {
                        matched: MatchedProvider {
                            service: target.name.clone(),
                            country: target.country.clone(),
                            source_id: availability.source_id.clone(),
                        },
                        reason: format!(
                            "fully available on {} ({}): {detail}",
                            target.name, target.country
                        ),
                    };
                }
                TargetVerdict::MissingSeasons { missing } => {
                    debug!(
                        title = %series.title,
                        service = %target.name,
                        missing = %format_seasons(&missing),
                        "partial availability"
                    );
                    if partial.is_none() {
                        partial = Some((target.name.clone(), missing));
                    }
                }
                TargetVerdict::NotOnService => {}
            }
        }

        let reason = if let Some((service, missing)) = partial {
            format!(
                "partially available on {service}: missing seasons {}",
                format_seasons(&missing)
            )
        } else if any_answer {
            "not available on any configured provider".to_string()
        } else if any_not_found {
            "not found on any configured provider".to_string()
        } else {
            "no availability source could be consulted".to_string()
        };
        MatchOutcome::NoMatch { reason }
    }

    async fn act(
        &self,
        series: &Series,
        matched: MatchedProvider,
        reason: String,
    ) -> SeriesResult {
        let decision = Decision::from(self.options.action);

        if self.options.dry_run {
            info!(title = %series.title, %reason, "dry run, would apply action");
            return SeriesResult {
                series_id: series.id,
                title: series.title.clone(),
                decision,
                matched_provider: Some(matched),
                reason,
                applied: false,
                error: None,
            };
        }

        let (applied, error) = match self
            .library
            .apply_action(series.id, self.options.action)
            .await
        {
            Ok(()) => (true, None),
            Err(err) => {
                warn!(title = %series.title, %err, "failed to apply action");
                (false, Some(err.to_string()))
            }
        };
        SeriesResult {
            series_id: series.id,
            title: series.title.clone(),
            decision,
            matched_provider: Some(matched),
            reason,
            applied,
            error,
        }
    }
}

enum MatchOutcome {
    Matched {
        matched: MatchedProvider,
        reason: String,
    },
    NoMatch {
        reason: String,
    },
}

/// What the cancellable decision phase concluded for one series.
enum SeriesDecision {
    /// Nothing left to do; the result goes straight into the report.
    Settled(SeriesResult),
    /// A target is fully covered; the action phase takes over.
    Matched {
        matched: MatchedProvider,
        reason: String,
    },
}

fn none_result(series: &Series, reason: &str) -> SeriesResult {
    SeriesResult {
        series_id: series.id,
        title: series.title.clone(),
        decision: Decision::None,
        matched_provider: None,
        reason: reason.to_string(),
        applied: false,
        error: None,
    }
}

fn cancelled_result(series: &Series) -> SeriesResult {
    none_result(series, "run cancelled")
}

fn format_seasons(seasons: &BTreeSet<u32>) -> String {
    seasons
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProviderCache;
    use crate::providers::mock::{season_level, series_level, MockOutcome, MockProvider};
    use crate::providers::AvailabilityProvider;
    use crate::ratelimit::RateLimiterSet;
    use crate::sonarr::MockLibrary;

    fn series(id: i64, title: &str, seasons: &[u32]) -> Series {
        Series {
            id,
            title: title.to_string(),
            imdb_id: Some(format!("tt{id:07}")),
            monitored_seasons: seasons.iter().copied().collect(),
            added: Some(Utc::now() - ChronoDuration::days(365)),
        }
    }

    fn options(targets: &[(&str, &str)], dry_run: bool) -> SyncOptions {
        SyncOptions {
            targets: targets
                .iter()
                .map(|(name, country)| Target {
                    name: name.to_string(),
                    country: country.to_string(),
                })
                .collect(),
            action: Action::Unmonitor,
            dry_run,
            exclude_recent_days: 7,
            concurrency: 2,
        }
    }

    struct Fixture {
        engine: SyncEngine,
        library: Arc<MockLibrary>,
        _dir: tempfile::TempDir,
    }

    fn fixture(
        source: Arc<MockProvider>,
        library: MockLibrary,
        options: SyncOptions,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ProviderCache::open(dir.path().join("cache")).unwrap());
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            vec![source as Arc<dyn AvailabilityProvider>],
            Arc::new(RateLimiterSet::new()),
            cache,
        ));
        let library = Arc::new(library);
        Fixture {
            engine: SyncEngine::new(orchestrator, Arc::clone(&library) as Arc<dyn LibraryManager>, options),
            library,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_fully_available_series_is_unmonitored() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(season_level("primary", "US", &[("netflix", &[1, 2])]));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "Show A", &[1, 2])]),
            options(&[("netflix", "US")], false),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.results[0].decision, Decision::Unmonitor);
        assert!(report.results[0].applied);
        assert_eq!(
            report.results[0].matched_provider.as_ref().unwrap().service,
            "netflix"
        );
        assert_eq!(fx.library.applied(), vec![(1, Action::Unmonitor)]);
    }

    #[tokio::test]
    async fn test_partial_coverage_is_never_acted_on() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(season_level("primary", "US", &[("netflix", &[1, 2])]));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "Show A", &[1, 2, 3])]),
            options(&[("netflix", "US")], false),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.results[0].decision, Decision::None);
        assert!(report.results[0].reason.contains("missing seasons 3"));
        assert!(fx.library.applied().is_empty());
    }

    #[tokio::test]
    async fn test_recently_added_series_is_excluded() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(series_level("primary", "US", &["netflix"]));

        let mut fresh = series(1, "Fresh Show", &[1]);
        fresh.added = Some(Utc::now() - ChronoDuration::days(2));

        let fx = fixture(
            source,
            MockLibrary::new(vec![fresh]),
            options(&[("netflix", "US")], false),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.results[0].decision, Decision::None);
        assert!(report.results[0].reason.contains("added within"));
        assert!(fx.library.applied().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_records_but_does_not_apply() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(series_level("primary", "US", &["netflix"]));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "Show A", &[1])]),
            options(&[("netflix", "US")], true),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.results[0].decision, Decision::Unmonitor);
        assert!(!report.results[0].applied);
        assert!(fx.library.applied().is_empty());
    }

    #[tokio::test]
    async fn test_first_matching_target_wins() {
        let source = Arc::new(MockProvider::new("primary"));
        // One resolution per country; the answer lists both services.
        source.push_success(series_level("primary", "US", &["netflix", "hulu"]));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "Show A", &[1])]),
            options(&[("hulu", "US"), ("netflix", "US")], true),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.results[0].matched_provider.as_ref().unwrap().service,
            "hulu"
        );
    }

    #[tokio::test]
    async fn test_apply_failure_is_recorded_and_run_continues() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(series_level("primary", "US", &["netflix"]));
        source.push_success(series_level("primary", "US", &["netflix"]));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "Doomed", &[1]), series(2, "Fine", &[1])])
                .fail_apply_for(1),
            options(&[("netflix", "US")], false),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert!(!report.results[0].applied);
        assert!(report.results[0].error.is_some());
        assert!(report.results[1].applied);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(fx.library.applied(), vec![(2, Action::Unmonitor)]);
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let source = Arc::new(MockProvider::new("primary"));
        for _ in 0..4 {
            source.push(MockOutcome::NotFound);
        }

        let fx = fixture(
            source,
            MockLibrary::new(vec![
                series(10, "First", &[1]),
                series(20, "Second", &[1]),
                series(30, "Third", &[1]),
                series(40, "Fourth", &[1]),
            ]),
            options(&[("netflix", "US")], true),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        let ids: Vec<i64> = report.results.iter().map(|r| r.series_id).collect();
        assert_eq!(ids, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_series_without_imdb_id_is_skipped() {
        let source = Arc::new(MockProvider::new("primary"));
        let mut unknown = series(1, "No Id", &[1]);
        unknown.imdb_id = None;

        let fx = fixture(
            source.clone(),
            MockLibrary::new(vec![unknown]),
            options(&[("netflix", "US")], false),
        );
        let report = fx.engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.results[0].decision, Decision::None);
        assert!(report.results[0].reason.contains("IMDb"));
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_processing() {
        let source = Arc::new(MockProvider::new("primary"));

        let fx = fixture(
            source,
            MockLibrary::new(vec![series(1, "A", &[1]), series(2, "B", &[1])]),
            options(&[("netflix", "US")], false),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fx.engine.run(cancel).await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert!(fx.library.applied().is_empty());
    }

    /// Cancels the run from inside `apply_action`, then finishes the action
    /// after a pause. If the engine dropped the in-flight future the record
    /// would be lost while the manager had (or would have) acted.
    #[derive(Debug)]
    struct SlowCancellingLibrary {
        series: Vec<Series>,
        cancel: CancellationToken,
        applied: parking_lot::Mutex<Vec<(i64, Action)>>,
    }

    #[async_trait::async_trait]
    impl LibraryManager for SlowCancellingLibrary {
        async fn list_monitored_series(&self) -> Result<Vec<Series>, LibraryError> {
            Ok(self.series.clone())
        }

        async fn apply_action(&self, series_id: i64, action: Action) -> Result<(), LibraryError> {
            self.cancel.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.applied.lock().push((series_id, action));
            Ok(())
        }

        async fn test_connection(&self) -> Result<(), LibraryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_does_not_interrupt_dispatched_action() {
        let source = Arc::new(MockProvider::new("primary"));
        source.push_success(series_level("primary", "US", &["netflix"]));

        let cancel = CancellationToken::new();
        let library = Arc::new(SlowCancellingLibrary {
            series: vec![series(1, "Show A", &[1])],
            cancel: cancel.clone(),
            applied: parking_lot::Mutex::new(Vec::new()),
        });

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ProviderCache::open(dir.path().join("cache")).unwrap());
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            vec![source as Arc<dyn AvailabilityProvider>],
            Arc::new(RateLimiterSet::new()),
            cache,
        ));
        let engine = SyncEngine::new(
            orchestrator,
            Arc::clone(&library) as Arc<dyn LibraryManager>,
            options(&[("netflix", "US")], false),
        );
        let report = engine.run(cancel).await.unwrap();

        // The action was already dispatched, so it must complete and the
        // report must say so.
        assert_eq!(*library.applied.lock(), vec![(1, Action::Unmonitor)]);
        assert!(report.results[0].applied);
        assert_eq!(report.results[0].decision, Decision::Unmonitor);
    }

    #[tokio::test]
    async fn test_empty_target_list_is_rejected() {
        let source = Arc::new(MockProvider::new("primary"));
        let fx = fixture(
            source,
            MockLibrary::new(Vec::new()),
            options(&[], true),
        );
        assert!(matches!(
            fx.engine.run(CancellationToken::new()).await,
            Err(SyncError::NoTargets)
        ));
    }
}
