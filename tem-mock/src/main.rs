//! HTTP service simulating an external API's concurrency ceiling and rate
//! limit, for exercising handlers and the auto-detect probe end-to-end.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tem_mock::{build_router, MockConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Mock HTTP service with a concurrency ceiling and rate limit", long_about = None)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:8088")]
    bind: SocketAddr,

    /// Maximum in-flight requests before responding 503.
    #[clap(long, default_value_t = 4)]
    concurrency: usize,

    /// Requests allowed per `rate_limit_window_ms` before responding 429.
    #[clap(long, default_value_t = 20)]
    rate_limit_requests: u32,

    #[clap(long, default_value_t = 1_000)]
    rate_limit_window_ms: u64,

    /// Artificial latency applied to every successful response.
    #[clap(long, default_value_t = 20)]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let app = build_router(MockConfig {
        concurrency: args.concurrency,
        rate_limit_requests: args.rate_limit_requests,
        rate_limit_window: Duration::from_millis(args.rate_limit_window_ms),
        latency: Duration::from_millis(args.latency_ms),
    });

    tracing::info!(bind = %args.bind, concurrency = args.concurrency, "tem-mock listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
