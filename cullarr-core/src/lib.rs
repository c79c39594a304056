//! Cullarr Core - Streaming availability resolution for Sonarr libraries
//!
//! This crate provides the building blocks for deciding whether monitored
//! series are fully watchable on the user's streaming subscriptions:
//! availability source clients with fallback orchestration, quota-aware rate
//! limiting, a durable response cache, and the sync engine that turns
//! verdicts into library-manager actions.

pub mod cache;
pub mod config;
pub mod fallback;
pub mod normalize;
pub mod providers;
pub mod ratelimit;
pub mod report;
pub mod resolver;
pub mod sonarr;
pub mod sync;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache::{CacheError, ProviderCache};
pub use config::{Config, ConfigError};
pub use fallback::FallbackOrchestrator;
pub use report::SyncReport;
pub use resolver::Action;
pub use sonarr::{LibraryError, LibraryManager, SonarrClient};
pub use sync::{SyncEngine, SyncError, SyncOptions};

/// Core errors that can bubble up from any Cullarr subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CullarrError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Library manager error: {0}")]
    Library(#[from] LibraryError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl CullarrError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            CullarrError::Config(e) => match e {
                ConfigError::AlreadyExists { path } => {
                    format!("A config file already exists at {}", path.display())
                }
                ConfigError::ReadFailed { path, .. } => {
                    format!("Could not read the config file at {}", path.display())
                }
                ConfigError::Invalid { reason } => format!("Invalid configuration: {reason}"),
                _ => "Configuration error occurred".to_string(),
            },
            CullarrError::Library(e) => match e {
                LibraryError::Unreachable { .. } => {
                    "Could not reach Sonarr, check the url in your config".to_string()
                }
                LibraryError::Unauthorized => {
                    "Sonarr rejected the API key, check your config".to_string()
                }
                _ => "Sonarr request failed".to_string(),
            },
            CullarrError::Sync(SyncError::NoTargets) => {
                "No streaming providers configured".to_string()
            }
            CullarrError::Sync(_) => "Sync run failed".to_string(),
            CullarrError::Cache(_) => "Cache storage error occurred".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CullarrError>;
