//! Single-request HTTP abstraction.
//!
//! The loop and the transfer workers speak to the service through
//! [`HttpTransport`] only; tests substitute scripted implementations and the
//! production one wraps a shared `reqwest` client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use once_cell::sync::OnceCell;

/// Per-request deadline used by the communication loop.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.body = serde_json::to_vec(value).ok();
        self.headers
            .push(("Content-Type".into(), "application/json".into()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased at construction.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// One request, one buffered response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Streaming GET for transfers: response head plus a chunk stream.
    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(HttpResponse, ByteStream), TransportError>;
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn builder() -> reqwest::ClientBuilder {
    let connect = Duration::from_secs(env_u64("PLINK_HTTP_CONNECT_TIMEOUT_SECS", 3).max(1));
    let keepalive = Duration::from_secs(env_u64("PLINK_HTTP_TCP_KEEPALIVE_SECS", 60).max(1));
    let pool_idle = Duration::from_secs(env_u64("PLINK_HTTP_POOL_IDLE_SECS", 90).max(1));
    reqwest::Client::builder()
        .user_agent(format!("plink/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect)
        .tcp_keepalive(keepalive)
        .pool_idle_timeout(pool_idle)
}

fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT.get_or_init(|| builder().build().expect("http client"))
}

/// Production transport backed by the shared `reqwest` client.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReqwestTransport;

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

fn response_head(status: u16, headers: &reqwest::header::HeaderMap) -> HttpResponse {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    HttpResponse {
        status,
        headers,
        body: Vec::new(),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let client = shared_client();
        let mut req = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        req = req.timeout(request.timeout);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }
        let response = req.send().await.map_err(classify)?;
        let mut out = response_head(response.status().as_u16(), response.headers());
        out.body = response.bytes().await.map_err(classify)?.to_vec();
        Ok(out)
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(HttpResponse, ByteStream), TransportError> {
        let client = shared_client();
        let mut req = client.get(url);
        for (name, value) in &headers {
            req = req.header(name, value);
        }
        let response = req.send().await.map_err(classify)?;
        let head = response_head(response.status().as_u16(), response.headers());
        let stream = response
            .bytes_stream()
            .map_err(classify)
            .boxed();
        Ok((head, stream))
    }
}
