//! CLI wrapper around the auto-detect probe. Prints a `ProbeResult` as JSON.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use reqwest::Method;
use tem_probe::{run_probe, ProbeConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Auto-detects an external API's concurrency ceiling and rate limit", long_about = None)]
struct Args {
    /// URL to probe.
    url: String,

    #[clap(long, default_value = "GET")]
    method: String,

    /// Repeatable "Key: Value" header.
    #[clap(long = "header", value_name = "KEY:VALUE")]
    headers: Vec<String>,

    #[clap(long)]
    body: Option<String>,

    #[clap(long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[clap(long, default_value_t = 256)]
    max_concurrency_to_test: usize,

    #[clap(long, default_value_t = 10_000)]
    rate_limit_test_duration_ms: u64,
}

fn parse_headers(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid header '{entry}', expected 'Key: Value'"))?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())?;
    let headers = parse_headers(&args.headers)?;

    let config = ProbeConfig {
        url: args.url,
        method,
        headers,
        body: args.body,
        timeout: Duration::from_millis(args.timeout_ms),
        max_concurrency_to_test: args.max_concurrency_to_test,
        rate_limit_test_duration: Duration::from_millis(args.rate_limit_test_duration_ms),
    };

    let result = run_probe(config).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
