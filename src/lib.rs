//! Proxy Probe - concurrent proxy prober
//!
//! Probes a list of HTTP, HTTPS, SOCKS4 and SOCKS5 proxies by fetching a test
//! URL through each one with a bounded pool of workers, streaming every result
//! as soon as it is known and finishing with a run summary.

pub mod config;
pub mod emitter;
pub mod error;
pub mod proxy;
pub mod server;
pub mod telemetry;

pub use config::Config;
pub use error::{ProbeError, Result};
pub use proxy::*;
