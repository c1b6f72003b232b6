//! Proxy checker module for probing a single proxy

use crate::error::ProbeFailure;
use crate::proxy::cancel::CancelSignal;
use crate::proxy::dialer::{DialOptions, ProxyDialer, DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT};
use crate::proxy::models::{ProbeOutcome, ProbeRequest};
use crate::proxy::parser::ProxyParser;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Default timeout for proxy checks in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of concurrent checks
const DEFAULT_WORKERS: usize = 10;

/// Default URL to test proxies against
const DEFAULT_TEST_URL: &str = "http://httpbin.org/ip";

/// Failures faster than this carry no meaningful timing and are reported without latency
pub const FAST_FAIL_THRESHOLD: Duration = Duration::from_millis(100);

/// Fields of a JSON response body that may hold the caller's public address
const ADDRESS_FIELDS: [&str; 3] = ["origin", "ip", "query"];

static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("Invalid IPv4 regex")
});

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each proxy check
    pub timeout: Duration,
    /// Number of concurrent lanes
    pub workers: usize,
    /// URL to test proxies against
    pub test_url: String,
    /// Failures faster than this are reported without a response time
    pub fast_fail_threshold: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: DEFAULT_WORKERS,
            test_url: DEFAULT_TEST_URL.to_string(),
            fast_fail_threshold: FAST_FAIL_THRESHOLD,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_fast_fail_threshold(mut self, threshold: Duration) -> Self {
        self.fast_fail_threshold = threshold;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Build the request for the descriptor at `index`
    pub fn request(&self, index: usize, source: &str) -> ProbeRequest {
        ProbeRequest {
            index,
            source: source.to_string(),
            target_url: self.test_url.clone(),
            timeout: self.timeout,
        }
    }
}

/// Something that can probe one proxy
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Probe one proxy. Every failure is reported inside the outcome.
    async fn probe(&self, request: ProbeRequest, cancel: CancelSignal) -> ProbeOutcome;
}

/// Proxy checker that probes proxies over the network
#[derive(Debug, Clone, Default)]
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    /// Create a new proxy checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new proxy checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check a single proxy line against the configured test URL
    pub async fn check_proxy(&self, source: &str) -> ProbeOutcome {
        self.probe_request(self.config.request(0, source), CancelSignal::new())
            .await
    }

    #[instrument(skip(self, request, cancel), fields(index = request.index, proxy = %request.source))]
    async fn probe_request(&self, request: ProbeRequest, cancel: CancelSignal) -> ProbeOutcome {
        let start = Instant::now();

        let proxy = match ProxyParser::parse(&request.source) {
            Ok(proxy) => proxy,
            Err(e) => {
                debug!("Rejected descriptor: {}", e);
                return ProbeOutcome::failure(request.source, e.to_string(), None);
            }
        };

        let options = DialOptions {
            timeout: request.timeout,
            user_agent: self.config.user_agent.clone(),
            max_redirects: self.config.max_redirects,
            accept_invalid_target_certs: false,
        }
        .for_target(&request.target_url);

        let transport = match ProxyDialer::build_transport(&proxy, &options) {
            Ok(transport) => transport,
            Err(e) => {
                debug!("Transport build failed: {}", e);
                return ProbeOutcome::failure(
                    request.source,
                    "Invalid host or port".to_string(),
                    None,
                );
            }
        };

        if cancel.is_cancelled() {
            return ProbeOutcome::failure(request.source, ProbeFailure::Aborted.to_string(), None);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeFailure::Aborted),
            fetched = tokio::time::timeout(
                request.timeout,
                Self::fetch(transport.client(), &request.target_url),
            ) => fetched.unwrap_or(Err(ProbeFailure::Timeout)),
        };

        let elapsed = start.elapsed();

        match result {
            Ok((status, body)) => {
                let elapsed_ms = elapsed.as_millis() as u64;
                debug!("Proxy reachable ({}) in {}ms", status.as_u16(), elapsed_ms);
                ProbeOutcome::success(
                    request.source,
                    format!("Connected successfully ({})", status.as_u16()),
                    elapsed_ms,
                )
                .with_ip(extract_address(&body))
            }
            Err(ProbeFailure::Aborted) => {
                debug!("Probe aborted");
                ProbeOutcome::failure(request.source, ProbeFailure::Aborted.to_string(), None)
            }
            Err(failure) => {
                debug!("Probe failed after {:?}: {}", elapsed, failure);
                let response_time = self.failure_latency(elapsed);
                ProbeOutcome::failure(request.source, failure.to_string(), response_time)
            }
        }
    }

    /// Issue the GET and read the body when the status counts as reachable
    async fn fetch(client: &Client, url: &str) -> Result<(StatusCode, String), ProbeFailure> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if !is_reachable(status) {
            return Err(classify_status(&response));
        }

        let body = response.text().await.map_err(classify_error)?;
        Ok((status, body))
    }

    fn failure_latency(&self, elapsed: Duration) -> Option<u64> {
        if elapsed < self.config.fast_fail_threshold {
            None
        } else {
            Some(elapsed.as_millis() as u64)
        }
    }
}

#[async_trait]
impl Prober for ProxyChecker {
    async fn probe(&self, request: ProbeRequest, cancel: CancelSignal) -> ProbeOutcome {
        self.probe_request(request, cancel).await
    }
}

fn is_reachable(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

fn classify_status(response: &Response) -> ProbeFailure {
    match response.status() {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ProbeFailure::ProxyAuthRequired,
        StatusCode::FORBIDDEN => ProbeFailure::Forbidden,
        StatusCode::BAD_GATEWAY => ProbeFailure::BadGateway,
        StatusCode::SERVICE_UNAVAILABLE => ProbeFailure::ServiceUnavailable,
        status => match response.error_for_status_ref() {
            Err(e) => ProbeFailure::Other(e.without_url().to_string()),
            Ok(_) => ProbeFailure::Other(format!("Unexpected HTTP status: {}", status)),
        },
    }
}

/// Classify a transport error by cause, in fixed priority order
///
/// Only the cause chain is matched against known texts. The top-level reqwest
/// message names the request URL, which says nothing about why it failed.
fn classify_error(err: reqwest::Error) -> ProbeFailure {
    let err = err.without_url();
    let io_kinds: Vec<io::ErrorKind> = sources(&err)
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .map(io::Error::kind)
        .collect();
    let causes = sources(&err)
        .skip(1)
        .map(|e| e.to_string().to_lowercase())
        .collect::<Vec<_>>()
        .join(": ");

    if io_kinds.contains(&io::ErrorKind::ConnectionRefused) || causes.contains("connection refused") {
        ProbeFailure::ConnectionRefused
    } else if err.is_timeout()
        || io_kinds.contains(&io::ErrorKind::TimedOut)
        || causes.contains("timed out")
    {
        ProbeFailure::Timeout
    } else if causes.contains("dns error")
        || causes.contains("failed to lookup address")
        || causes.contains("name or service not known")
        || causes.contains("no such host")
    {
        ProbeFailure::HostNotFound
    } else if causes.contains("tls") || causes.contains("ssl") || causes.contains("certificate") {
        ProbeFailure::Tls
    } else {
        match err.status() {
            Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED) => ProbeFailure::ProxyAuthRequired,
            Some(StatusCode::FORBIDDEN) => ProbeFailure::Forbidden,
            Some(StatusCode::BAD_GATEWAY) => ProbeFailure::BadGateway,
            Some(StatusCode::SERVICE_UNAVAILABLE) => ProbeFailure::ServiceUnavailable,
            // CONNECT tunnels report the proxy's refusal only as text
            _ if causes.contains("proxy authentication required")
                || causes.contains("proxy authorization required") =>
            {
                ProbeFailure::ProxyAuthRequired
            }
            _ => ProbeFailure::Other(describe(&err)),
        }
    }
}

fn sources<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Error text including every cause in the chain
fn describe(err: &(dyn StdError + 'static)) -> String {
    sources(err)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Extract a reported public address from a test endpoint's response body
///
/// JSON objects are searched for `origin`, `ip`, then `query`. Anything that is
/// not JSON is scanned for the first dotted-quad IPv4 address.
pub fn extract_address(body: &str) -> Option<String> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => ADDRESS_FIELDS.iter().find_map(|field| match map.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }),
        Ok(Value::String(text)) => scan_ipv4(&text),
        Ok(_) => None,
        Err(_) => scan_ipv4(body),
    }
}

fn scan_ipv4(text: &str) -> Option<String> {
    IPV4_REGEX.find(text).map(|m| m.as_str().to_string())
}
