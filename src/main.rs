use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::profile::{InMemoryProfileProvider, TenantId};
use floodgate::ratelimit::{
    rules, BufferedAsyncLimiter, LimitLevel, LimitedApi, RateLimitRegistry, TokenBucketLimiter,
};

/// Inspect and exercise rate limit configurations.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a configuration string and print its tiers
    Validate {
        config: String,
        /// Print the tiers as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge two configuration strings
    Merge { first: String, second: String },
    /// Drive a token bucket limiter at a fixed request rate
    Simulate {
        #[arg(long)]
        config: String,
        /// Use interval refill instead of greedy refill
        #[arg(long)]
        interval: bool,
        #[arg(long, default_value_t = 100)]
        requests: u64,
        /// Requests per second
        #[arg(long, default_value_t = 10.0)]
        rate: f64,
    },
    /// Check an api limit from the default profile through the registry
    Check {
        /// Api name, e.g. REST_REQUESTS_PER_TENANT
        #[arg(long)]
        api: LimitedApi,
        #[arg(long, default_value_t = 10)]
        requests: u64,
    },
    /// Run concurrent acquirers against a buffered limiter
    Buffered {
        #[arg(long)]
        permits: Option<usize>,
        #[arg(long)]
        queue: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, default_value_t = 20)]
        requests: usize,
        /// How long each acquirer holds its permit
        #[arg(long, default_value_t = 50)]
        hold_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.settings {
        Some(path) => FloodgateConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FloodgateConfig::from_env().context("reading environment configuration")?,
    };

    init_tracing(&config.logging);
    debug!(version = env!("CARGO_PKG_VERSION"), "Floodgate starting");

    match cli.command {
        Command::Validate { config, json } => validate(&config, json),
        Command::Merge { first, second } => {
            println!("{}", rules::merge(&first, &second)?);
            Ok(())
        }
        Command::Simulate {
            config,
            interval,
            requests,
            rate,
        } => simulate(&config, interval, requests, rate).await,
        Command::Check { api, requests } => check(&config, api, requests),
        Command::Buffered {
            permits,
            queue,
            timeout_ms,
            requests,
            hold_ms,
        } => {
            let mut buffered = config.buffered.clone();
            buffered.max_permits = permits.unwrap_or(buffered.max_permits);
            buffered.max_queue_depth = queue.unwrap_or(buffered.max_queue_depth);
            buffered.queue_timeout_ms = timeout_ms.unwrap_or(buffered.queue_timeout_ms);
            run_buffered(buffered.build(), requests, Duration::from_millis(hold_ms)).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn validate(config: &str, json: bool) -> anyhow::Result<()> {
    let entries = rules::parse_limits(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!(
                "{} per {}s ({:.3}/s sustained)",
                entry.capacity,
                entry.duration_seconds,
                entry.capacity as f64 / entry.duration_seconds as f64
            );
        }
    }
    Ok(())
}

async fn simulate(config: &str, interval: bool, requests: u64, rate: f64) -> anyhow::Result<()> {
    let period = request_period(rate)?;
    let limiter = TokenBucketLimiter::new(config, interval)?;
    info!(
        configuration = %limiter.configuration(),
        mode = ?limiter.refill_mode(),
        requests = requests,
        rate = rate,
        "Simulating"
    );

    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    let mut admitted = 0u64;

    for request in 0..requests {
        ticker.tick().await;
        if limiter.try_consume() {
            admitted += 1;
            debug!(request = request, elapsed = ?started.elapsed(), "Admitted");
        } else {
            debug!(request = request, elapsed = ?started.elapsed(), "Rejected");
        }
    }

    info!(
        admitted = admitted,
        rejected = requests - admitted,
        elapsed = ?started.elapsed(),
        "Simulation finished"
    );
    println!("admitted {} of {}", admitted, requests);
    Ok(())
}

/// Time between simulated requests at `rate` requests per second.
fn request_period(rate: f64) -> anyhow::Result<Duration> {
    anyhow::ensure!(rate.is_finite() && rate > 0.0, "rate must be positive");
    let period = Duration::try_from_secs_f64(1.0 / rate)
        .with_context(|| format!("rate {} is too low", rate))?;
    anyhow::ensure!(
        !period.is_zero(),
        "rate {} is too high, at most one request per nanosecond",
        rate
    );
    Ok(period)
}

fn check(config: &FloodgateConfig, api: LimitedApi, requests: u64) -> anyhow::Result<()> {
    let profiles = Arc::new(InMemoryProfileProvider::with_default(
        config.default_profile.clone(),
    ));
    let registry = RateLimitRegistry::from_config(&config.registry, profiles);
    let tenant = TenantId::new();

    match api.limit_config(&config.default_profile) {
        Some(limit) => info!(api = %api, limit = %limit, "Checking limit"),
        None => warn!(api = %api, "No limit configured, every request is admitted"),
    }

    let mut admitted = 0u64;
    for _ in 0..requests {
        if registry.check_rate_limit_for(api, tenant, api_level(api, tenant))? {
            admitted += 1;
        }
    }
    println!("admitted {} of {}", admitted, requests);
    Ok(())
}

/// Per-tenant apis are tracked for the tenant; the rest get a throwaway session.
fn api_level(api: LimitedApi, tenant: TenantId) -> LimitLevel {
    if api.is_per_tenant() {
        LimitLevel::Tenant(tenant)
    } else {
        LimitLevel::Session("cli".to_string())
    }
}

async fn run_buffered(
    limiter: BufferedAsyncLimiter,
    requests: usize,
    hold: Duration,
) -> anyhow::Result<()> {
    info!(
        permits = limiter.max_permits(),
        queue = limiter.max_queue_depth(),
        timeout = ?limiter.timeout(),
        requests = requests,
        "Running buffered acquirers"
    );

    let tasks = (0..requests).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let outcome = limiter.acquire().await;
            if outcome.is_ok() {
                tokio::time::sleep(hold).await;
                limiter.release();
            }
            outcome
        })
    });

    let mut granted = 0usize;
    let mut rejected = 0usize;
    for joined in futures::future::join_all(tasks).await {
        match joined? {
            Ok(()) => granted += 1,
            Err(err) => {
                debug!(error = %err, "Request rejected");
                rejected += 1;
            }
        }
    }

    println!("granted {}, rejected {}", granted, rejected);
    Ok(())
}
