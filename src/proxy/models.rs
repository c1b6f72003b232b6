//! Proxy data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Proxy type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    /// Port assumed when a URL-form descriptor omits one
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyType::Http => 80,
            ProxyType::Https => 443,
            ProxyType::Socks4 | ProxyType::Socks5 => 1080,
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "https" => Some(ProxyType::Https),
            "socks4" => Some(ProxyType::Socks4),
            "socks5" => Some(ProxyType::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks4 => write!(f, "socks4"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

/// Proxy authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A parsed proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl Proxy {
    /// Create a new proxy without authentication
    pub fn new(host: String, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            host,
            port,
            proxy_type,
            auth: None,
        }
    }

    /// Create a new proxy with authentication
    pub fn with_auth(
        host: String,
        port: u16,
        proxy_type: ProxyType,
        username: String,
        password: String,
    ) -> Self {
        Self {
            host,
            port,
            proxy_type,
            auth: Some(ProxyAuth::new(username, password)),
        }
    }

    /// Get the proxy URL string
    pub fn url(&self) -> String {
        let auth_part = self.auth.as_ref().map_or(String::new(), |auth| {
            format!("{}:{}@", auth.username, auth.password)
        });

        format!("{}://{}{}:{}", self.proxy_type, auth_part, self.url_host(), self.port)
    }

    /// Host as it must appear inside a URL; IPv6 literals are bracketed
    pub fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Get the proxy string in HOST:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the proxy string with auth in HOST:PORT:USER:PASS format
    pub fn to_full_string(&self) -> String {
        match &self.auth {
            Some(auth) => format!("{}:{}:{}:{}", self.host, self.port, auth.username, auth.password),
            None => self.to_simple_string(),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// One unit of work handed to a prober
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Position of the descriptor in the submitted list
    pub index: usize,
    /// Raw descriptor text as submitted
    pub source: String,
    pub target_url: String,
    pub timeout: Duration,
}

/// Final classification of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Failure,
}

/// Result of probing a single proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Descriptor text exactly as submitted
    pub proxy: String,
    pub status: ProbeStatus,
    pub message: String,
    #[serde(rename = "responseTime", skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Public address reported by the test endpoint, when one could be found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl ProbeOutcome {
    pub fn success(proxy: String, message: String, response_time_ms: u64) -> Self {
        Self {
            proxy,
            status: ProbeStatus::Success,
            message,
            response_time_ms: Some(response_time_ms),
            ip: None,
        }
    }

    pub fn failure(proxy: String, message: String, response_time_ms: Option<u64>) -> Self {
        Self {
            proxy,
            status: ProbeStatus::Failure,
            message,
            response_time_ms,
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    pub fn is_working(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Aggregate numbers for a run that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(rename = "totalTime")]
    pub total_time_ms: u64,
    #[serde(rename = "workersUsed")]
    pub workers_used: usize,
    #[serde(rename = "totalProxies")]
    pub total_proxies: usize,
    #[serde(rename = "workingProxies")]
    pub working_proxies: usize,
}
