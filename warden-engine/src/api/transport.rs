//! HTTPS transport behind the API client
//!
//! The [`HttpTransport`] trait is the seam between request routing (which
//! IP to dial, in which order) and the actual HTTPS exchange, so routing can
//! be tested without sockets.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ClientConfig;

use super::pinning::{client_config, PinSet, PIN_FAILURE_MARKER};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One HTTPS exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Logical host: TLS server name and `Host` header
    pub host: String,
    /// Absolute path, starting with `/`
    pub path: String,
    pub method: HttpMethod,
    /// JSON body
    pub body: Option<Vec<u8>>,
    /// Dial this address instead of resolving `host`
    pub target: Option<IpAddr>,
    /// Overrides the transport's whole-request timeout
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Performs HTTPS requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest` transport with pinned rustls configurations
pub struct ReqwestTransport {
    tls: HashMap<String, ClientConfig>,
    dial_timeout: Duration,
    request_timeout: Duration,
    clients: Mutex<HashMap<(String, Option<IpAddr>), reqwest::Client>>,
}

impl ReqwestTransport {
    /// `hosts` lists each logical host with its pin set
    pub fn new(
        hosts: &[(&str, PinSet)],
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut tls = HashMap::new();
        for (host, pins) in hosts {
            tls.insert(host.to_string(), client_config(pins, host)?);
        }
        Ok(Self {
            tls,
            dial_timeout,
            request_timeout,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, host: &str, target: Option<IpAddr>) -> Result<reqwest::Client> {
        let key = (host.to_string(), target);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let tls = self
            .tls
            .get(host)
            .cloned()
            .ok_or_else(|| Error::Http(format!("unknown host type: {}", host)))?;

        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(self.dial_timeout)
            .timeout(self.request_timeout)
            .no_proxy();
        if let Some(ip) = target {
            builder = builder.resolve(host, SocketAddr::new(ip, 443));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {}", e)))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let client = self.client(&request.host, request.target)?;
        let url = format!("https://{}{}", request.host, request.path);

        let mut builder = match request.method {
            HttpMethod::Get => client.get(&url),
            HttpMethod::Post => client.post(&url),
        };
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

fn classify(err: reqwest::Error) -> Error {
    let mut source: Option<&dyn std::error::Error> = Some(&err);
    while let Some(e) = source {
        if e.to_string().contains(PIN_FAILURE_MARKER) {
            return Error::CertificatePinFailure(err.to_string());
        }
        source = e.source();
    }
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_cache_per_target() {
        let transport = ReqwestTransport::new(
            &[("api.example.net", PinSet::new(["GhSHA5uyW9Det5rDNeDkIqWeZDJV9B9EgKg4tJk36zM="]))],
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
        .unwrap();

        let ip: IpAddr = "198.51.100.10".parse().unwrap();
        transport.client("api.example.net", None).unwrap();
        transport.client("api.example.net", Some(ip)).unwrap();
        transport.client("api.example.net", Some(ip)).unwrap();
        assert_eq!(transport.clients.lock().unwrap().len(), 2);

        assert!(transport.client("other.example.net", None).is_err());
    }

    #[test]
    fn test_unpinned_host_refused() {
        let result = ReqwestTransport::new(
            &[("api.example.net", PinSet::default())],
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert!(matches!(result, Err(Error::CertificatePinFailure(_))));
    }
}
