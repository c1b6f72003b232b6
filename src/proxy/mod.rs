//! Proxy module for parsing and probing proxies
//!
//! This module provides functionality for:
//! - Parsing proxy descriptors (HOST:PORT, HOST:PORT:USER:PASS, scheme://...)
//! - Building a per-proxy HTTP transport for HTTP, HTTPS, SOCKS4 and SOCKS5
//! - Probing a single proxy and classifying the outcome
//! - Probing a whole list with a bounded pool of concurrent lanes

pub mod cancel;
pub mod checker;
pub mod dialer;
pub mod models;
pub mod parser;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::CancelSignal;
pub use checker::{extract_address, CheckerConfig, Prober, ProxyChecker, FAST_FAIL_THRESHOLD};
pub use dialer::{DialOptions, ProxyDialer, Transport};
pub use models::{
    ProbeOutcome, ProbeRequest, ProbeStatus, Proxy, ProxyAuth, ProxyType, RunSummary,
};
pub use parser::ProxyParser;
pub use scheduler::{clamp_workers, RunReport, RunState, WorkerPool, MAX_WORKERS};
