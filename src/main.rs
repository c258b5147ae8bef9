use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use global_throttle::config::ThrottleConfig;
use global_throttle::counter::{
    MemoryStore, RedisStore, RemoteCounter, SlidingWindowCounter, UnavailableCounter,
};
use global_throttle::ratelimit::{Gate, GateOptions, LocalDecisionCache, RemoteAddr, Verdict};

/// Evaluate requests against a route's global rate limit.
#[derive(Debug, Parser)]
#[command(name = "global-throttle", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route whose policy to apply
    #[arg(short, long)]
    route: String,

    /// Client address of the simulated requests
    #[arg(long, default_value = "127.0.0.1")]
    remote_addr: IpAddr,

    /// Request header as 'Name: value'; may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,

    /// Number of requests to evaluate
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u64,

    /// Count in process instead of in the configured remote store
    #[arg(long)]
    memory: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Global Throttle");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ThrottleConfig::load(args.config.as_deref())?;
    let policy = config.route(&args.route)?.clone();
    info!(
        route = %args.route,
        namespace = %policy.namespace,
        limit = policy.limit,
        window_size = policy.window_size,
        "Configuration loaded"
    );

    let counter: Arc<dyn RemoteCounter> = if args.memory {
        // The in-process store needs no connection; mark the remote as
        // configured so limiting is enabled.
        if !config.remote.is_configured() {
            config.remote.host = "memory".to_string();
            config.remote.port = 1;
        }
        info!("Using in-process counter store");
        Arc::new(SlidingWindowCounter::new(MemoryStore::new()))
    } else if config.remote.is_configured() {
        match RedisStore::connect(&config.remote).await {
            Ok(store) => Arc::new(SlidingWindowCounter::new(store)),
            Err(err) => {
                warn!(
                    host = %config.remote.host,
                    port = config.remote.port,
                    error = %err,
                    "Counter store unreachable, admitting all requests"
                );
                Arc::new(UnavailableCounter::new(err.to_string()))
            }
        }
    } else {
        warn!("No counter store configured, rate limiting is disabled");
        Arc::new(SlidingWindowCounter::new(MemoryStore::new()))
    };

    let cache = Arc::new(LocalDecisionCache::new(config.cache.capacity));
    let purger = cache.spawn_purger(config.cache.purge_interval());
    let gate = Gate::new(counter, cache, GateOptions::from_config(&config)?);

    tokio::select! {
        result = run(&gate, &policy, &args) => result?,
        _ = shutdown_signal() => {}
    }

    purger.abort();
    info!(stats = ?gate.stats().snapshot(), "Global Throttle stopped");
    Ok(())
}

/// Evaluate the configured number of requests, printing one JSON line each.
async fn run(
    gate: &Gate,
    policy: &global_throttle::ratelimit::Policy,
    args: &Args,
) -> anyhow::Result<()> {
    for sequence in 1..=args.requests {
        let request = build_request(args)?;
        let verdict = gate.evaluate(policy, &request).await;
        println!("{}", verdict_line(sequence, &verdict));
    }
    Ok(())
}

fn build_request(args: &Args) -> anyhow::Result<http::Request<()>> {
    let mut builder = http::Request::builder().uri(args.path.as_str());
    for (name, value) in &args.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let mut request = builder.body(()).context("invalid request")?;
    request.extensions_mut().insert(RemoteAddr(args.remote_addr));
    Ok(request)
}

fn verdict_line(sequence: u64, verdict: &Verdict) -> serde_json::Value {
    match verdict {
        Verdict::Admit => serde_json::json!({ "request": sequence, "verdict": "admit" }),
        Verdict::RemoteUnavailable => {
            serde_json::json!({ "request": sequence, "verdict": "admit", "remote": "unavailable" })
        }
        Verdict::Deny(denial) => serde_json::json!({
            "request": sequence,
            "verdict": "deny",
            "status": denial.status.as_u16(),
            "source": denial.source.as_str(),
            "estimated_count": denial.estimated_count,
            "cooldown_ms": denial.cooldown.map(|c| c.as_millis() as u64),
        }),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
