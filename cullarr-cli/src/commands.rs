//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use cullarr_core::cache::{self, ProviderCache};
use cullarr_core::config::{Config, SourceSettings};
use cullarr_core::fallback::FallbackOrchestrator;
use cullarr_core::providers::{
    AvailabilityProvider, StreamingAvailabilityProvider, TmdbProvider, UtellyProvider,
};
use cullarr_core::ratelimit::RateLimiterSet;
use cullarr_core::sonarr::{LibraryManager, SonarrClient};
use cullarr_core::sync::{SyncEngine, SyncOptions};
use cullarr_core::CullarrError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check availability and unmonitor or delete fully available series
    Sync {
        /// Path to the config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Preview decisions without touching Sonarr
        #[arg(long)]
        dry_run: bool,
        /// Emit the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show Sonarr connectivity, quota usage, and cache statistics
    Check {
        /// Path to the config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Emit the status as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a starter config file
    Init {
        /// Where to write it (defaults to the platform config directory)
        path: Option<PathBuf>,
    },
    /// Load and validate the config file
    Validate {
        /// Path to the config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns an error describing what failed, suitable for direct display.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Sync {
            config,
            dry_run,
            json,
        } => run_sync(config, dry_run, json).await,
        Commands::Check { config, json } => run_check(config, json).await,
        Commands::Config { command } => match command {
            ConfigCommands::Init { path } => config_init(path),
            ConfigCommands::Validate { config } => config_validate(config),
        },
    }
}

fn config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    Config::default_path()
        .context("could not determine the default config location; pass --config")
}

fn state_dir(config: &Config) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &config.state_dir {
        return Ok(dir.clone());
    }
    cache::default_state_dir()
        .context("could not determine the state directory; set state_dir in the config")
}

/// Everything a run needs, wired from one config.
struct Runtime {
    sonarr: Arc<SonarrClient>,
    orchestrator: Arc<FallbackOrchestrator>,
    limiters: Arc<RateLimiterSet>,
    cache: Arc<ProviderCache>,
}

fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    let state_dir = state_dir(config)?;
    let cache = Arc::new(
        ProviderCache::open(state_dir.join("cache")).map_err(CullarrError::Cache)?,
    );

    let mut limiters = RateLimiterSet::new();
    let mut sources: Vec<Arc<dyn AvailabilityProvider>> = Vec::new();

    let enabled = |settings: &Option<SourceSettings>| {
        settings.as_ref().filter(|s| s.enabled).cloned()
    };

    if let Some(tmdb) = enabled(&config.sources.tmdb) {
        let provider = TmdbProvider::new(tmdb.api_key.clone(), tmdb.cache_ttl())
            .with_id_cache(Arc::clone(&cache));
        limiters.insert(provider.id(), tmdb.rate_limit());
        sources.push(Arc::new(provider));
    }
    if let Some(sa) = enabled(&config.sources.streaming_availability) {
        let provider = StreamingAvailabilityProvider::new(sa.api_key.clone(), sa.cache_ttl());
        limiters.insert(provider.id(), sa.rate_limit());
        sources.push(Arc::new(provider));
    }
    if let Some(utelly) = enabled(&config.sources.utelly) {
        let provider = UtellyProvider::new(utelly.api_key.clone(), utelly.cache_ttl());
        limiters.insert(provider.id(), utelly.rate_limit());
        sources.push(Arc::new(provider));
    }
    if sources.is_empty() {
        bail!("no availability sources are enabled in the config");
    }

    limiters.restore_from(&state_dir.join("quota_state.json"));
    let limiters = Arc::new(limiters);

    let sonarr = Arc::new(SonarrClient::new(
        config.sonarr.url.clone(),
        config.sonarr.api_key.clone(),
    ));
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        sources,
        Arc::clone(&limiters),
        Arc::clone(&cache),
    ));

    Ok(Runtime {
        sonarr,
        orchestrator,
        limiters,
        cache,
    })
}

async fn run_sync(config: Option<PathBuf>, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let path = config_path(config)?;
    let config = Config::load(&path)
        .map_err(|e| anyhow::anyhow!(CullarrError::from(e).user_message()))?;
    let runtime = build_runtime(&config)?;

    let options = SyncOptions {
        targets: config.normalized_targets(),
        action: config.sync.action,
        dry_run: dry_run || config.sync.dry_run,
        exclude_recent_days: config.sync.exclude_recent_days,
        concurrency: config.sync.concurrency,
    };
    let engine = SyncEngine::new(
        Arc::clone(&runtime.orchestrator),
        runtime.sonarr as Arc<dyn LibraryManager>,
        options,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight series");
            signal_cancel.cancel();
        }
    });

    let report = engine
        .run(cancel)
        .await
        .map_err(|e| anyhow::anyhow!(CullarrError::from(e).user_message()))?;

    // Quota spent this run must survive into the next one.
    if let Err(err) = runtime.limiters.flush() {
        warn!(%err, "failed to persist quota state");
    }

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

async fn run_check(config: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let path = config_path(config)?;
    let config = Config::load(&path)
        .map_err(|e| anyhow::anyhow!(CullarrError::from(e).user_message()))?;
    let runtime = build_runtime(&config)?;

    let sonarr_status = match runtime.sonarr.test_connection().await {
        Ok(()) => "ok".to_string(),
        Err(err) => CullarrError::from(err).user_message(),
    };
    let quota = runtime.limiters.usage();
    let cache_stats = runtime.cache.statistics();

    if json {
        let status = serde_json::json!({
            "sonarr": sonarr_status,
            "quota": quota,
            "cache": cache_stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Sonarr: {sonarr_status}");
    println!("Quota usage:");
    for usage in quota {
        let daily = usage
            .daily_quota
            .map(|q| format!("{}/{q} today", usage.daily_used))
            .unwrap_or_else(|| "no daily cap".to_string());
        let monthly = usage
            .monthly_quota
            .map(|q| format!("{}/{q} this month", usage.monthly_used))
            .unwrap_or_else(|| "no monthly cap".to_string());
        println!("  {}: {daily}, {monthly}", usage.provider_id);
    }
    println!(
        "Cache: {} entries, {} hits / {} misses this session ({})",
        cache_stats.entries,
        cache_stats.hits,
        cache_stats.misses,
        cache_stats.cache_dir.display()
    );
    Ok(())
}

fn config_init(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path(path)?;
    Config::write_template(&path)
        .map_err(|e| anyhow::anyhow!(CullarrError::from(e).user_message()))?;
    println!("Wrote starter config to {}", path.display());
    println!("Fill in your Sonarr and source API keys before running `cullarr sync`.");
    Ok(())
}

fn config_validate(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path(config)?;
    let config = Config::load(&path)
        .map_err(|e| anyhow::anyhow!(CullarrError::from(e).user_message()))?;
    println!("Config at {} is valid.", path.display());
    println!(
        "  {} streaming provider target(s), action = {}, dry_run = {}",
        config.streaming_providers.len(),
        config.sync.action,
        config.sync.dry_run
    );
    Ok(())
}
