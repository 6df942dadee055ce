//! Auto-detect probe: infers an external API's concurrency ceiling and rate
//! limit by exponential/binary search and burst testing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use tokio::task::JoinSet;

const COMMON_WINDOW_SIZES_SECS: &[u64] = &[1, 5, 10, 15, 20, 30, 60];
const CONCURRENCY_SAFETY_MARGIN: f64 = 0.8;
const RATE_LIMIT_SAFETY_MARGIN: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub max_concurrency_to_test: usize,
    pub rate_limit_test_duration: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitEstimate {
    pub requests: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimitEstimate>,
    pub confidence: Confidence,
    pub notes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("http client build error: {0}")]
    Client(#[from] reqwest::Error),
}

struct Outcome {
    status: Option<StatusCode>,
    retry_after: Option<Duration>,
}

async fn send_one(client: &Client, config: &ProbeConfig) -> Outcome {
    let mut builder = client.request(config.method.clone(), &config.url).timeout(config.timeout);
    for (k, v) in &config.headers {
        builder = builder.header(k, v);
    }
    if let Some(body) = &config.body {
        builder = builder.body(body.clone());
    }
    match builder.send().await {
        Ok(response) => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .or_else(|| {
                    response
                        .headers()
                        .get("x-ratelimit-reset")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                });
            Outcome {
                status: Some(response.status()),
                retry_after,
            }
        }
        Err(_) => Outcome {
            status: None,
            retry_after: None,
        },
    }
}

async fn send_concurrent(client: &Client, config: &ProbeConfig, n: usize) -> Vec<Outcome> {
    let mut set = JoinSet::new();
    for _ in 0..n {
        let client = client.clone();
        let config = config.clone();
        set.spawn(async move { send_one(&client, &config).await });
    }
    let mut outcomes = Vec::with_capacity(n);
    while let Some(result) = set.join_next().await {
        if let Ok(outcome) = result {
            outcomes.push(outcome);
        }
    }
    outcomes
}

fn is_ceiling(status: Option<StatusCode>) -> bool {
    matches!(status, Some(StatusCode::BAD_GATEWAY) | Some(StatusCode::SERVICE_UNAVAILABLE))
}

fn is_rate_limited(status: Option<StatusCode>) -> bool {
    matches!(status, Some(StatusCode::TOO_MANY_REQUESTS))
}

/// Exponential search upward from 1, doubling until a ceiling (502/503) or a
/// 429 is observed, then binary search between the last safe level and the
/// first failing one. Returns the raw detected level, before the 80% safety
/// margin is applied.
async fn detect_concurrency_raw(client: &Client, config: &ProbeConfig, notes: &mut Vec<String>) -> (usize, bool) {
    let mut last_safe = 0usize;
    let mut level = 1usize;
    let mut failing = None;
    let mut abandoned_for_rate_limit = false;

    loop {
        if level > config.max_concurrency_to_test {
            notes.push(format!(
                "reached max_concurrency_to_test ({}) without observing a ceiling",
                config.max_concurrency_to_test
            ));
            last_safe = level / 2;
            break;
        }

        let outcomes = send_concurrent(client, config, level).await;
        if outcomes.iter().any(|o| is_rate_limited(o.status)) {
            notes.push(format!("429 observed at concurrency {level}, abandoning concurrency search"));
            abandoned_for_rate_limit = true;
            last_safe = level.max(1) - 1;
            break;
        }
        if outcomes.iter().any(|o| is_ceiling(o.status)) {
            failing = Some(level);
            break;
        }

        last_safe = level;
        level *= 2;
    }

    if let Some(mut hi) = failing {
        let mut lo = last_safe;
        while hi.saturating_sub(lo) > 1 {
            let mid = lo + (hi - lo) / 2;
            let outcomes = send_concurrent(client, config, mid).await;
            if outcomes.iter().any(|o| is_ceiling(o.status)) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        notes.push(format!("binary search converged: safe={lo} failing={hi}"));
        last_safe = lo;
    }

    (last_safe.max(1), abandoned_for_rate_limit)
}

/// Bursts requests at `probe_concurrency` for `config.rate_limit_test_duration`,
/// tracking 429s and their `Retry-After`/`X-RateLimit-Reset` hints, then snaps
/// the inferred window to the nearest common size and applies a 90% safety
/// margin to the observed pre-429 request count.
async fn detect_rate_limit(
    client: &Client,
    config: &ProbeConfig,
    probe_concurrency: usize,
    notes: &mut Vec<String>,
) -> Option<RateLimitEstimate> {
    let deadline = Instant::now() + config.rate_limit_test_duration;
    let mut requests_before_first_429 = 0u32;
    let mut first_429_seen = false;
    let mut retry_after_hints: Vec<Duration> = Vec::new();
    let mut inter_429_gaps: Vec<Duration> = Vec::new();
    let mut last_429_at: Option<Instant> = None;

    while Instant::now() < deadline {
        let outcomes = send_concurrent(client, config, probe_concurrency.max(1)).await;
        for outcome in outcomes {
            if is_rate_limited(outcome.status) {
                let now = Instant::now();
                if !first_429_seen {
                    first_429_seen = true;
                }
                if let Some(prev) = last_429_at {
                    inter_429_gaps.push(now.duration_since(prev));
                }
                last_429_at = Some(now);
                if let Some(hint) = outcome.retry_after {
                    retry_after_hints.push(hint);
                }
            } else if !first_429_seen {
                requests_before_first_429 += 1;
            }
        }
    }

    if !first_429_seen {
        notes.push("no 429 observed during rate-limit burst; unable to estimate a rate limit".to_string());
        return None;
    }

    let window = if !retry_after_hints.is_empty() {
        let avg_secs: f64 =
            retry_after_hints.iter().map(Duration::as_secs_f64).sum::<f64>() / retry_after_hints.len() as f64;
        notes.push(format!("used Retry-After/X-RateLimit-Reset hints, average {avg_secs:.1}s"));
        avg_secs
    } else if !inter_429_gaps.is_empty() {
        let avg_secs: f64 =
            inter_429_gaps.iter().map(Duration::as_secs_f64).sum::<f64>() / inter_429_gaps.len() as f64;
        notes.push(format!("inferred window from inter-429 spacing, average {avg_secs:.1}s"));
        avg_secs
    } else {
        notes.push("only a single 429 observed with no header hints; defaulting to a 1s window".to_string());
        1.0
    };

    let snapped = COMMON_WINDOW_SIZES_SECS
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (*a as f64 - window).abs();
            let db = (*b as f64 - window).abs();
            da.partial_cmp(&db).unwrap()
        })
        .unwrap_or(1);

    let margined_requests = (requests_before_first_429 as f64 * RATE_LIMIT_SAFETY_MARGIN).floor().max(1.0) as u32;

    Some(RateLimitEstimate {
        requests: margined_requests,
        window_ms: snapped * 1_000,
    })
}

fn assess_confidence(concurrency: usize, abandoned_for_rate_limit: bool, rate_limit: &Option<RateLimitEstimate>) -> Confidence {
    let concurrency_in_range = (1..=10_000).contains(&concurrency);
    let clear_rate_limit_signal = rate_limit.is_some();

    if concurrency_in_range && clear_rate_limit_signal && !abandoned_for_rate_limit {
        Confidence::High
    } else if concurrency_in_range || clear_rate_limit_signal {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

pub async fn run_probe(config: ProbeConfig) -> Result<ProbeResult, ProbeError> {
    let client = Client::builder().timeout(config.timeout).build()?;
    let mut notes = Vec::new();

    let (concurrency_raw, abandoned_for_rate_limit) = detect_concurrency_raw(&client, &config, &mut notes).await;
    let concurrency = (concurrency_raw as f64 * CONCURRENCY_SAFETY_MARGIN).floor().max(1.0) as usize;

    let probe_concurrency = ((concurrency_raw as f64) * 0.8).max(1.0) as usize;
    let rate_limit = detect_rate_limit(&client, &config, probe_concurrency, &mut notes).await;

    let confidence = assess_confidence(concurrency, abandoned_for_rate_limit, &rate_limit);

    Ok(ProbeResult {
        concurrency,
        rate_limit,
        confidence,
        notes,
    })
}
