use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use slidecount::config::SlidecountConfig;
use slidecount::ratelimit::{LimitCounter, LimitKey, RateLimiter, TimeWindow};

/// Drive a sliding window rate limiter with synthetic traffic.
#[derive(Debug, Parser)]
#[command(name = "slidecount", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the window length (second, minute, hour, day)
    #[arg(long)]
    window: Option<TimeWindow>,

    /// Override the request limit per window
    #[arg(long)]
    limit: Option<u64>,

    /// Number of distinct clients
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// Average requests per second sent by each client
    #[arg(long, default_value_t = 10.0)]
    rps: f64,

    /// Stop after this many seconds (runs until Ctrl+C when omitted)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default)]
struct Tally {
    allowed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Summary {
    clients: usize,
    request_limit: u64,
    window_length_ms: u64,
    allowed: u64,
    rejected: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Slidecount load simulator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => SlidecountConfig::from_file(path)?,
        None => SlidecountConfig::default(),
    };
    if let Some(window) = args.window {
        config.counter.window_length_ms = window.duration().as_millis() as u64;
    }
    if let Some(limit) = args.limit {
        config.limiter.request_limit = limit;
    }
    config.validate()?;
    info!(
        window_length_ms = config.counter.window_length_ms,
        request_limit = config.limiter.request_limit,
        fingerprint = ?config.counter.fingerprint,
        "Configuration loaded"
    );

    let counter = config.counter.build_local(Utc::now())?;
    let limiter = Arc::new(RateLimiter::new(config.limit_config(), counter)?);
    let tally = Arc::new(Tally::default());
    let (stop_tx, stop_rx) = watch::channel(false);

    let clients: Vec<_> = (0..args.clients)
        .map(|i| {
            tokio::spawn(run_client(
                i,
                args.rps,
                Arc::clone(&limiter),
                Arc::clone(&tally),
                stop_rx.clone(),
            ))
        })
        .collect();

    let reporter = tokio::spawn(report(
        config.counter.window_length(),
        Arc::clone(&tally),
        stop_rx.clone(),
    ));

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(secs = secs, "Simulation time elapsed");
                }
                _ = shutdown_signal() => {}
            }
        }
        None => shutdown_signal().await,
    }

    stop_tx.send(true)?;
    futures::future::join_all(clients).await;
    reporter.await?;

    let summary = Summary {
        clients: args.clients,
        request_limit: config.limiter.request_limit,
        window_length_ms: config.counter.window_length_ms,
        allowed: tally.allowed.load(Ordering::Relaxed),
        rejected: tally.rejected.load(Ordering::Relaxed),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            allowed = summary.allowed,
            rejected = summary.rejected,
            "Slidecount load simulator stopped"
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Send requests for one client with exponentially distributed gaps.
async fn run_client(
    id: usize,
    rps: f64,
    limiter: Arc<RateLimiter<dyn LimitCounter>>,
    tally: Arc<Tally>,
    mut stop: watch::Receiver<bool>,
) {
    let key = LimitKey::new().with("client", &id.to_string()).to_string_key();
    let mean_gap = 1.0 / rps.max(0.001);

    loop {
        let gap = {
            let mut rng = rand::thread_rng();
            -mean_gap * (1.0 - rng.gen::<f64>()).ln()
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(gap)) => {}
            _ = stop.changed() => return,
        }

        let status = limiter.decide(&key, 1, Utc::now()).await;
        if status.is_allowed() {
            tally.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            tally.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                retry_after_secs = status.retry_after_secs(),
                "Request rejected"
            );
        }
    }
}

/// Log the running totals once per window.
async fn report(window_length: Duration, tally: Arc<Tally>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(window_length);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    allowed = tally.allowed.load(Ordering::Relaxed),
                    rejected = tally.rejected.load(Ordering::Relaxed),
                    "Window elapsed"
                );
            }
            _ = stop.changed() => return,
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
