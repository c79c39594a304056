//! Run report: per-series results plus aggregate counts.
//!
//! The report is the run's only output contract. Results keep the library
//! manager's input order regardless of processing order, and the same data
//! renders as a human summary or serializes to JSON for scripting.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fallback::SidelinedSource;
use crate::resolver::Action;

/// What the run decided for one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    None,
    Unmonitor,
    Delete,
}

impl From<Action> for Decision {
    fn from(action: Action) -> Self {
        match action {
            Action::Unmonitor => Decision::Unmonitor,
            Action::Delete => Decision::Delete,
        }
    }
}

/// The target that satisfied the availability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedProvider {
    /// Canonical streaming-service id from the user's target list.
    pub service: String,
    pub country: String,
    /// Data source that produced the answer.
    pub source_id: String,
}

/// Outcome for a single series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResult {
    pub series_id: i64,
    pub title: String,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_provider: Option<MatchedProvider>,
    pub reason: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate counts over all results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Count of non-`none` decisions by kind.
    pub actions_by_kind: BTreeMap<String, usize>,
    /// Count of matches per streaming service.
    pub providers_matched: BTreeMap<String, usize>,
}

impl Summary {
    fn from_results(results: &[SeriesResult]) -> Self {
        let mut actions_by_kind = BTreeMap::new();
        let mut providers_matched = BTreeMap::new();
        let mut failed = 0;

        for result in results {
            if result.error.is_some() {
                failed += 1;
            }
            match result.decision {
                Decision::None => {}
                Decision::Unmonitor => {
                    *actions_by_kind.entry("unmonitor".to_string()).or_insert(0) += 1;
                }
                Decision::Delete => {
                    *actions_by_kind.entry("delete".to_string()).or_insert(0) += 1;
                }
            }
            if let Some(matched) = &result.matched_provider {
                *providers_matched.entry(matched.service.clone()).or_insert(0) += 1;
            }
        }

        Summary {
            total_processed: results.len(),
            successful: results.len() - failed,
            failed,
            actions_by_kind,
            providers_matched,
        }
    }
}

/// Full report for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub timestamp: DateTime<Utc>,
    pub dry_run: bool,
    pub action: Action,
    pub summary: Summary,
    pub results: Vec<SeriesResult>,
    /// Data sources taken out of rotation during the run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sidelined_sources: Vec<SidelinedSource>,
}

impl SyncReport {
    pub fn new(
        dry_run: bool,
        action: Action,
        results: Vec<SeriesResult>,
        sidelined_sources: Vec<SidelinedSource>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            dry_run,
            action,
            summary: Summary::from_results(&results),
            results,
            sidelined_sources,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable run summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "Sync report{mode}: action = {}", self.action);
        let _ = writeln!(out);

        for result in &self.results {
            let marker = match result.decision {
                Decision::None => "-",
                Decision::Unmonitor | Decision::Delete => {
                    if result.applied {
                        "*"
                    } else {
                        "~"
                    }
                }
            };
            let _ = write!(out, "  {marker} {} : {}", result.title, result.reason);
            if let Some(err) = &result.error {
                let _ = write!(out, " [error: {err}]");
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} series processed, {} ok, {} failed",
            self.summary.total_processed, self.summary.successful, self.summary.failed
        );
        for (kind, count) in &self.summary.actions_by_kind {
            let _ = writeln!(out, "  {kind}: {count}");
        }
        for source in &self.sidelined_sources {
            let _ = writeln!(
                out,
                "  source '{}' sidelined: {}",
                source.provider_id, source.reason
            );
        }
        out
    }
}
