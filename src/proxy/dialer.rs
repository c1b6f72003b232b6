//! Builds a one-shot HTTP client routed through a single proxy

use crate::error::DialError;
use crate::proxy::models::{Proxy, ProxyType};
use reqwest::{redirect, Client, Proxy as ReqwestProxy};
use std::time::Duration;
use tracing::debug;

/// Default user agent for probe requests
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Default number of redirect hops a probe follows
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Request policy applied to every transport
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Skip certificate validation for the target connection
    pub accept_invalid_target_certs: bool,
}

impl DialOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            accept_invalid_target_certs: false,
        }
    }

    /// Certificate checks are relaxed only for https targets
    pub fn for_target(mut self, target_url: &str) -> Self {
        self.accept_invalid_target_certs = target_url
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
        self
    }
}

/// A client that routes requests through exactly one proxy
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
}

impl Transport {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Maps proxy descriptors to configured transports
pub struct ProxyDialer;

impl ProxyDialer {
    /// Build a transport for `proxy`. Performs no network I/O.
    pub fn build_transport(proxy: &Proxy, options: &DialOptions) -> Result<Transport, DialError> {
        if proxy.host.is_empty() || proxy.port == 0 {
            return Err(DialError::InvalidEndpoint(proxy.to_simple_string()));
        }

        let reqwest_proxy = match proxy.proxy_type {
            ProxyType::Socks4 | ProxyType::Socks5 => Self::socks_proxy(proxy)?,
            ProxyType::Http | ProxyType::Https => Self::http_proxy(proxy)?,
        };

        debug!(
            "Building {} transport via {}",
            proxy.proxy_type,
            proxy.to_simple_string()
        );

        let client = Client::builder()
            .proxy(reqwest_proxy)
            .user_agent(options.user_agent.as_str())
            .redirect(redirect::Policy::limited(options.max_redirects))
            .timeout(options.timeout)
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(options.accept_invalid_target_certs)
            .build()?;

        Ok(Transport { client })
    }

    /// SOCKS proxies carry credentials in the URL for the handshake sub-negotiation
    fn socks_proxy(proxy: &Proxy) -> Result<ReqwestProxy, DialError> {
        let url = format!("{}://{}", proxy.proxy_type, Self::authority(proxy));
        Ok(ReqwestProxy::all(url)?)
    }

    /// HTTP and HTTPS descriptors both speak plain HTTP proxying to the endpoint
    fn http_proxy(proxy: &Proxy) -> Result<ReqwestProxy, DialError> {
        let url = format!("http://{}", Self::authority(proxy));
        let reqwest_proxy = ReqwestProxy::all(url)?;

        Ok(match &proxy.auth {
            Some(auth) => reqwest_proxy.basic_auth(&auth.username, &auth.password),
            None => reqwest_proxy,
        })
    }

    fn authority(proxy: &Proxy) -> String {
        let host = proxy.url_host();

        match (&proxy.proxy_type, &proxy.auth) {
            (ProxyType::Socks4 | ProxyType::Socks5, Some(auth)) => {
                format!("{}:{}@{}:{}", auth.username, auth.password, host, proxy.port)
            }
            _ => format!("{}:{}", host, proxy.port),
        }
    }
}
