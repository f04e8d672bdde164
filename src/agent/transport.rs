//! Loopback HTTP plumbing between the driver and the agent.

use super::codec::QueryParams;
use super::requests::RequestDescriptor;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// One GET request aimed at `/agent/<name>` on a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub port: u16,
    pub name: &'static str,
    pub params: QueryParams,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Path and query, e.g. `/agent/status?cookie=abc`.
    pub fn path_and_query(&self) -> String {
        format!("/agent/{}{}", self.name, self.params.to_query_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
}

/// Issues GET requests with a timeout and hands back status and text body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError>;
}

/// `reqwest`-backed transport talking to a fixed host (loopback by default).
pub struct ReqwestTransport {
    client: reqwest::Client,
    host: String,
}

impl ReqwestTransport {
    pub fn new(host: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }

    pub fn url_for(&self, request: &HttpRequest) -> String {
        format!(
            "http://{}:{}{}",
            self.host,
            request.port,
            request.path_and_query()
        )
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        let url = self.url_for(&request);
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Request(e.to_string())
            }
        };

        let response = self
            .client
            .get(&url)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_err)?;
        Ok(HttpReply { status, body })
    }
}

/// Result of one request as seen by the state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome<R> {
    /// Network error, timeout or abort. Carries nothing.
    TransportFailed,
    /// The agent answered; the payload may still encode a refusal.
    Completed(R),
}

impl<R> RequestOutcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TransportFailed => None,
        }
    }
}

impl<R> RequestOutcome<Option<R>> {
    /// Collapses transport failures and decode failures into `None`.
    pub fn value(self) -> Option<R> {
        self.completed().flatten()
    }
}

/// A candidate or confirmed agent endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConnection {
    port: u16,
    cookie: Option<String>,
}

impl AgentConnection {
    pub fn new(port: u16) -> Self {
        Self { port, cookie: None }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn build_request<P, R>(
        &self,
        descriptor: &RequestDescriptor<P, R>,
        params: &P,
        timeout: Duration,
    ) -> HttpRequest {
        let mut query = descriptor.params(params);
        if descriptor.requires_auth {
            query.push_opt("cookie", self.cookie.clone());
        }
        HttpRequest {
            port: self.port,
            name: descriptor.name,
            params: query,
            timeout,
        }
    }

    /// Sends one request and decodes the answer.
    pub async fn perform<P, R>(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
        descriptor: &RequestDescriptor<P, R>,
        params: &P,
    ) -> RequestOutcome<R> {
        let request = self.build_request(descriptor, params, timeout);
        match transport.get(request).await {
            Ok(reply) => RequestOutcome::Completed(descriptor.decode(reply.status, &reply.body)),
            Err(error) => {
                debug!(port = self.port, request = descriptor.name, %error, "agent request failed");
                RequestOutcome::TransportFailed
            }
        }
    }
}
