// ABOUTME: CLI fetch command - dispatch URLs through the router and report each result
//
// All requests are dispatched from a background task while results are read
// from the router's response stream, so admission backpressure never stalls
// the reader. Prints one line per result, then per-pool metrics.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use serde::Serialize;

use hostpool::config::AppConfig;
use hostpool::pool::{MetricsSnapshot, PoolError, Request, Response, Router};
use hostpool::transport::TcpTransport;

use super::{FetchArgs, OutputFormat};

/// Caller context carried through the router with each request
#[derive(Debug)]
struct FetchTarget {
    index: usize,
    url: String,
    started: Instant,
}

/// Outcome of one fetch as displayed
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub index: usize,
    pub url: String,
    pub status: Option<u16>,
    pub bytes: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl FetchOutcome {
    fn new(result: Result<Response, PoolError>, target: FetchTarget) -> Self {
        let elapsed_ms = u64::try_from(target.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(response) => Self {
                index: target.index,
                url: target.url,
                status: Some(response.status()),
                bytes: response.body().len(),
                elapsed_ms,
                error: None,
            },
            Err(err) => Self {
                index: target.index,
                url: target.url,
                status: None,
                bytes: 0,
                elapsed_ms,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Metrics of one pool after the run
#[derive(Debug, Serialize)]
struct PoolSummary {
    pool: String,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

/// Execute the fetch command
pub async fn execute(args: FetchArgs, format: OutputFormat, config: &AppConfig) -> Result<()> {
    let headers = parse_headers(&args.headers)?;
    let (router, mut responses) = Router::builder(Arc::new(TcpTransport::new()))
        .settings(config.pool.clone())
        .hosts(config.hosts.clone())
        .build::<FetchTarget>()
        .context("Invalid pool settings")?;

    let total = args.urls.len() * args.repeat;
    let dispatcher = {
        let router = router.clone();
        let urls = args.urls;
        let method = args.method;
        let repeat = args.repeat;
        tokio::spawn(async move {
            let mut index = 0;
            for _ in 0..repeat {
                for url in &urls {
                    let mut request = Request::new(&method, url.clone());
                    for (name, value) in &headers {
                        request = request.with_header(name, value);
                    }
                    let target = FetchTarget {
                        index,
                        url: url.clone(),
                        started: Instant::now(),
                    };
                    router.dispatch(request, target).await;
                    index += 1;
                }
            }
        })
    };

    let mut failures = 0;
    for _ in 0..total {
        let Some((result, target)) = responses.next().await else {
            break;
        };
        let outcome = FetchOutcome::new(result, target);
        if outcome.error.is_some() {
            failures += 1;
        }
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&outcome)?),
            OutputFormat::Text => print_outcome(&outcome),
        }
    }

    dispatcher.await.context("Dispatch task failed")?;

    let summaries: Vec<PoolSummary> = router
        .pool_keys()
        .into_iter()
        .filter_map(|key| router.gateway(&key))
        .map(|gateway| PoolSummary {
            pool: gateway.key().to_string(),
            metrics: gateway.metrics().snapshot(),
        })
        .collect();
    router.shutdown_all().await;

    if format == OutputFormat::Text {
        print_summaries(&summaries);
    }

    if failures > 0 {
        return Err(anyhow!("{failures} of {total} requests failed"));
    }
    Ok(())
}

/// Parse `Name: value` header arguments
pub fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| anyhow!("Invalid header `{header}`, expected `Name: value`"))
        })
        .collect()
}

fn print_outcome(outcome: &FetchOutcome) {
    match (&outcome.status, &outcome.error) {
        (Some(status), _) => println!(
            "#{:<5} {:<3} {:>8}B {:>6}ms {}",
            outcome.index, status, outcome.bytes, outcome.elapsed_ms, outcome.url
        ),
        (None, Some(error)) => println!(
            "#{:<5} ERR {:>8}  {:>6}ms {} ({error})",
            outcome.index, "-", outcome.elapsed_ms, outcome.url
        ),
        (None, None) => {}
    }
}

fn print_summaries(summaries: &[PoolSummary]) {
    if summaries.is_empty() {
        return;
    }

    println!();
    println!(
        "{:<40} {:>8} {:>8} {:>8} {:>8}",
        "POOL", "REQUESTS", "RETRIES", "FAILED", "CONNS"
    );
    println!("{}", "-".repeat(76));
    for summary in summaries {
        println!(
            "{:<40} {:>8} {:>8} {:>8} {:>8}",
            summary.pool,
            summary.metrics.requests_total,
            summary.metrics.retries_total,
            summary.metrics.failures_total,
            summary.metrics.connections_opened
        );
    }
}
