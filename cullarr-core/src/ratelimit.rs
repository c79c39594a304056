//! Per-provider request throttling and quota accounting.
//!
//! Each provider gets one limiter combining a short sliding window (e.g.
//! 40 requests per 10 seconds) with optional daily and monthly hard ceilings.
//! The sliding window replenishes and callers may wait it out; a hard ceiling
//! that is reached sidelines the provider until the window rolls over.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which quota bucket an acquisition was counted against or rejected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    /// Short sliding window (seconds scale), replenishes continuously.
    Sliding,
    /// Calendar-day ceiling, resets at midnight UTC.
    Daily,
    /// Calendar-month ceiling, resets on the 1st.
    Monthly,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Sliding => write!(f, "sliding window"),
            QuotaWindow::Daily => write!(f, "daily quota"),
            QuotaWindow::Monthly => write!(f, "monthly quota"),
        }
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Request counted; caller may proceed.
    Granted,
    /// Sliding window full; it will have room after this duration.
    RetryAfter(Duration),
    /// A hard ceiling is reached; the provider is done for this window.
    Exhausted(QuotaWindow),
}

/// Limiter settings for one provider.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sliding window length.
    pub window: Duration,
    /// Maximum requests inside the sliding window.
    pub max_requests: u32,
    /// Optional calendar-day ceiling.
    pub daily_quota: Option<u32>,
    /// Optional calendar-month ceiling.
    pub monthly_quota: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_requests: 40,
            daily_quota: None,
            monthly_quota: None,
        }
    }
}

/// Point-in-time usage numbers, used by the `check` command.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub provider_id: String,
    pub sliding_used: u32,
    pub sliding_max: u32,
    pub daily_used: u32,
    pub daily_quota: Option<u32>,
    pub monthly_used: u32,
    pub monthly_quota: Option<u32>,
}

#[derive(Debug)]
struct Counters {
    /// Timestamps of requests inside the sliding window, oldest first.
    recent: VecDeque<Instant>,
    /// (ordinal day, count) for the daily ceiling.
    day: (i32, u32),
    /// ((year, month), count) for the monthly ceiling.
    month: ((i32, u32), u32),
}

/// Sliding-window rate limiter with optional hard ceilings for one provider.
///
/// Counters live behind a mutex so concurrent workers hitting the same
/// provider serialize through it without double-counting.
#[derive(Debug)]
pub struct ProviderRateLimiter {
    provider_id: String,
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

impl ProviderRateLimiter {
    pub fn new(provider_id: impl Into<String>, config: RateLimitConfig) -> Self {
        let now = Utc::now();
        Self {
            provider_id: provider_id.into(),
            config,
            counters: Mutex::new(Counters {
                recent: VecDeque::new(),
                day: (day_ordinal(now), 0),
                month: (year_month(now), 0),
            }),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Attempts to count one request against every configured window.
    ///
    /// Hard ceilings are checked first: a request that would exceed the daily
    /// or monthly quota is rejected before any counter is incremented, so the
    /// ceiling can never be overshot. A full sliding window reports the wait
    /// until its oldest counted request expires.
    pub fn try_acquire(&self) -> Acquire {
        let now = Utc::now();
        let mut counters = self.counters.lock();

        // Roll hard windows over before checking them.
        if counters.day.0 != day_ordinal(now) {
            counters.day = (day_ordinal(now), 0);
        }
        if counters.month.0 != year_month(now) {
            counters.month = (year_month(now), 0);
        }

        if let Some(quota) = self.config.daily_quota {
            if counters.day.1 >= quota {
                return Acquire::Exhausted(QuotaWindow::Daily);
            }
        }
        if let Some(quota) = self.config.monthly_quota {
            if counters.month.1 >= quota {
                return Acquire::Exhausted(QuotaWindow::Monthly);
            }
        }

        // Expire sliding-window entries.
        let horizon = Instant::now();
        while let Some(oldest) = counters.recent.front() {
            if horizon.duration_since(*oldest) >= self.config.window {
                counters.recent.pop_front();
            } else {
                break;
            }
        }

        if counters.recent.len() as u32 >= self.config.max_requests {
            let oldest = *counters
                .recent
                .front()
                .expect("window full implies non-empty");
            let wait = self
                .config
                .window
                .saturating_sub(horizon.duration_since(oldest));
            return Acquire::RetryAfter(wait.max(Duration::from_millis(1)));
        }

        counters.recent.push_back(horizon);
        counters.day.1 += 1;
        counters.month.1 += 1;
        Acquire::Granted
    }

    /// Acquires a slot, waiting out the sliding window once if needed.
    ///
    /// Hard-ceiling exhaustion is returned immediately; callers treat it as
    /// "provider unavailable this run" rather than retrying.
    pub async fn acquire(&self) -> Acquire {
        match self.try_acquire() {
            Acquire::RetryAfter(wait) => {
                debug!(
                    provider = %self.provider_id,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit window full, waiting"
                );
                tokio::time::sleep(wait).await;
                self.try_acquire()
            }
            other => other,
        }
    }

    /// Current usage across all windows.
    pub fn usage(&self) -> QuotaUsage {
        let now = Utc::now();
        let mut counters = self.counters.lock();

        if counters.day.0 != day_ordinal(now) {
            counters.day = (day_ordinal(now), 0);
        }
        if counters.month.0 != year_month(now) {
            counters.month = (year_month(now), 0);
        }
        let horizon = Instant::now();
        while let Some(oldest) = counters.recent.front() {
            if horizon.duration_since(*oldest) >= self.config.window {
                counters.recent.pop_front();
            } else {
                break;
            }
        }

        QuotaUsage {
            provider_id: self.provider_id.clone(),
            sliding_used: counters.recent.len() as u32,
            sliding_max: self.config.max_requests,
            daily_used: counters.day.1,
            daily_quota: self.config.daily_quota,
            monthly_used: counters.month.1,
            monthly_quota: self.config.monthly_quota,
        }
    }

    fn restore_hard_counts(&self, state: &PersistedQuota, now: DateTime<Utc>) {
        let mut counters = self.counters.lock();
        if state.day_ordinal == day_ordinal(now) {
            counters.day = (state.day_ordinal, state.day_count);
        }
        if (state.year, state.month) == year_month(now) {
            counters.month = ((state.year, state.month), state.month_count);
        }
    }

    fn persisted(&self) -> PersistedQuota {
        let counters = self.counters.lock();
        PersistedQuota {
            day_ordinal: counters.day.0,
            day_count: counters.day.1,
            year: counters.month.0.0,
            month: counters.month.0.1,
            month_count: counters.month.1,
        }
    }
}

fn day_ordinal(ts: DateTime<Utc>) -> i32 {
    ts.num_days_from_ce()
}

fn year_month(ts: DateTime<Utc>) -> (i32, u32) {
    (ts.year(), ts.month())
}

/// On-disk snapshot of one provider's hard-window counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedQuota {
    day_ordinal: i32,
    day_count: u32,
    year: i32,
    month: u32,
    month_count: u32,
}

/// All limiters for a run, keyed by canonical provider id.
///
/// Constructed at run start, optionally restored from the persisted quota
/// state, and flushed at run end so daily/monthly ceilings survive restarts.
#[derive(Debug, Default)]
pub struct RateLimiterSet {
    limiters: HashMap<String, Arc<ProviderRateLimiter>>,
    state_path: Option<PathBuf>,
}

impl RateLimiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a limiter for a provider, replacing any previous one.
    pub fn insert(&mut self, provider_id: impl Into<String>, config: RateLimitConfig) {
        let id = provider_id.into();
        self.limiters
            .insert(id.clone(), Arc::new(ProviderRateLimiter::new(id, config)));
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderRateLimiter>> {
        self.limiters.get(provider_id).cloned()
    }

    pub fn usage(&self) -> Vec<QuotaUsage> {
        let mut usage: Vec<_> = self.limiters.values().map(|l| l.usage()).collect();
        usage.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        usage
    }

    /// Restores daily/monthly counts persisted by a previous run.
    ///
    /// A missing or unreadable state file is treated as a fresh start; stale
    /// entries (older windows) are ignored by the rollover check.
    pub fn restore_from(&mut self, path: &Path) {
        self.state_path = Some(path.to_path_buf());
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let persisted: HashMap<String, PersistedQuota> = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring corrupt quota state file");
                return;
            }
        };
        let now = Utc::now();
        for (id, state) in &persisted {
            if let Some(limiter) = self.limiters.get(id) {
                limiter.restore_hard_counts(state, now);
            }
        }
        debug!(path = %path.display(), "restored quota state");
    }

    /// Writes daily/monthly counts for the next run.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let snapshot: HashMap<&str, PersistedQuota> = self
            .limiters
            .iter()
            .map(|(id, limiter)| (id.as_str(), limiter.persisted()))
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }
}
