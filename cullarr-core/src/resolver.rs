//! All-or-nothing availability decisions.
//!
//! Given one source's answer for a (title, country) pair and the set of
//! seasons the user still monitors, decide whether a target streaming service
//! fully covers the series. Partial coverage never produces an action.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::providers::ProviderAvailability;

/// The action to take when a series is fully available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Flip monitoring off in the library manager, keep files.
    Unmonitor,
    /// Remove the series from the library manager, keep files on disk.
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Unmonitor => write!(f, "unmonitor"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Verdict for one series against one target service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TargetVerdict {
    /// Every monitored season is covered by the service.
    FullyAvailable {
        /// Monitored seasons confirmed available. Empty when the match is
        /// series-level.
        covered_seasons: BTreeSet<u32>,
    },
    /// The service carries the series but is missing monitored seasons.
    MissingSeasons { missing: BTreeSet<u32> },
    /// The answer does not list the service at all.
    NotOnService,
}

/// Evaluates whether `service` fully covers the monitored seasons in one
/// source answer.
///
/// Season-granular data for the service is authoritative when present: the
/// listed seasons must be a superset of the monitored set. A service listed
/// without season detail counts as whole-series availability.
pub fn evaluate_target(
    availability: &ProviderAvailability,
    service: &str,
    monitored_seasons: &BTreeSet<u32>,
) -> TargetVerdict {
    if !availability.has_service(service) {
        return TargetVerdict::NotOnService;
    }

    match availability.seasons_for(service) {
        Some(available) => {
            let missing: BTreeSet<u32> = monitored_seasons.difference(available).copied().collect();
            if missing.is_empty() {
                TargetVerdict::FullyAvailable {
                    covered_seasons: monitored_seasons
                        .intersection(available)
                        .copied()
                        .collect(),
                }
            } else {
                TargetVerdict::MissingSeasons { missing }
            }
        }
        None => TargetVerdict::FullyAvailable {
            covered_seasons: BTreeSet::new(),
        },
    }
}
