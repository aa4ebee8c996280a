use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::error::TurnstileError;
use turnstile::ratelimit::{Limiter, RateLimitRequest, RateLimitResult};

/// Admission control over newline-delimited JSON requests.
///
/// Reads one `RateLimitRequest` per line on stdin and writes one
/// `RateLimitResult` per line on stdout.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// How each request is decided
    #[arg(short, long, value_enum, default_value_t = Mode::Check)]
    mode: Mode,

    /// Force JSON log output
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Decide without queueing
    Check,
    /// Queue denied requests when the matched rule allows it
    Consume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        rules = config.limiter.rules.len(),
        mode = ?cli.mode,
        "Configuration loaded"
    );

    let limiter = Arc::new(Limiter::new(config.limiter)?);

    // Report limiter events off the decision path.
    let mut events = limiter.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(event = ?event, "Limiter event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event reporter lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        result = process_requests(&limiter, cli.mode) => result?,
        _ = shutdown_signal() => {}
    }

    for stats in limiter.get_stats(None) {
        info!(
            key = %stats.key,
            rule = %stats.rule_id,
            total = stats.total,
            allowed = stats.allowed,
            rejected = stats.rejected,
            queued = stats.queued,
            peak_usage = stats.peak_usage,
            "Final usage"
        );
    }

    limiter.destroy();
    reporter.await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout carries decisions, so logs go to stderr.
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Decide every request read from stdin until EOF.
async fn process_requests(limiter: &Limiter, mode: Mode) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: RateLimitRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };

        let result = decide(limiter, &request, mode).await?;
        let mut out = serde_json::to_vec(&result)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

async fn decide(
    limiter: &Limiter,
    request: &RateLimitRequest,
    mode: Mode,
) -> Result<RateLimitResult, TurnstileError> {
    match mode {
        Mode::Check => Ok(limiter.check(request).await),
        Mode::Consume => match limiter.consume(request).await {
            Ok(result) => Ok(result),
            Err(TurnstileError::RateLimitExceeded { result, .. }) => Ok(*result),
            Err(e) => Err(e),
        },
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
