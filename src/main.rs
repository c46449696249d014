use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::adapter::{AdmissionAdapter, AdmissionRequest};
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::RateLimiter;

/// Evaluate admission requests for one caller and print the responses.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Caller identifier (API key, IP address, ...)
    identifier: String,

    /// Subscription tier of the caller
    #[arg(short, long)]
    tier: Option<String>,

    /// Endpoint to scope the quota to
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Number of back-to-back requests to evaluate
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Keep running with the sweeper active until Ctrl+C
    #[arg(long)]
    hold: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())?;
    info!(
        violation_threshold = config.limiter.violation_threshold,
        block_duration_secs = config.limiter.block_duration_secs,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::with_config(&config)?);
    let sweeper = limiter.start_sweeper();
    let adapter = AdmissionAdapter::new(Arc::clone(&limiter));

    let mut request = AdmissionRequest::new(args.identifier);
    request.tier = args.tier;
    request.endpoint = args.endpoint;

    for _ in 0..args.count {
        let reply = adapter.admit(&request);
        let headers: serde_json::Map<String, serde_json::Value> = reply
            .headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone().into()))
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "status": reply.status,
                "headers": headers,
                "body": reply.body,
            })
        );
    }

    if args.hold {
        info!("Holding with sweeper active, press Ctrl+C to exit");
        signal::ctrl_c().await?;
    }

    sweeper.shutdown().await;
    info!("Turnstile stopped");
    Ok(())
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
        builder.compact().init();
    }
}
