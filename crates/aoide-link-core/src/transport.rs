//! HTTP exchange with the backend.
//!
//! The gateway only talks to the backend through the [`Transport`] trait: one
//! request in, one status plus parsed JSON body out. [`HttpTransport`] is the
//! production implementation on top of `reqwest`; tests plug in scripted
//! transports through a custom [`Connector`].

use crate::api::{HttpMethod, WebRequest};
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Status and parsed body of a response
#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status: u16,
    /// `Value::Null` for an empty body
    pub content: Value,
}

impl JsonResponse {
    #[must_use]
    pub fn ok(content: Value) -> Self {
        Self {
            status: 200,
            content,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed JSON body (HTTP {status}): {message}")]
    MalformedJson { status: u16, message: String },
}

/// Performs a single HTTP exchange
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(
        &self,
        request: &WebRequest,
        timeout: Duration,
    ) -> Result<JsonResponse, TransportError>;
}

/// Creates a transport for the endpoint announced by the backend
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, GatewayError>;
}

/// Base URL for an endpoint announced as `host:port` (or a full URL)
pub fn endpoint_base_url(endpoint: &str) -> Result<Url, GatewayError> {
    let endpoint = endpoint.trim();
    let candidate = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if endpoint.matches(':').count() > 1 && !endpoint.starts_with('[') {
        // Bare IPv6 address with a trailing port, e.g. `::1:8080`
        match endpoint.rsplit_once(':') {
            Some((host, port)) => format!("http://[{host}]:{port}"),
            None => format!("http://{endpoint}"),
        }
    } else {
        format!("http://{endpoint}")
    };
    let url = Url::parse(&candidate)
        .map_err(|err| GatewayError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    if url.host_str().is_none() {
        return Err(GatewayError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(url)
}

/// `reqwest` based transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self, GatewayError> {
        let base_url = endpoint_base_url(endpoint)?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|err| GatewayError::Runtime(err.to_string()))?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, request: &WebRequest) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(&request.path)
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(
        &self,
        request: &WebRequest,
        timeout: Duration,
    ) -> Result<JsonResponse, TransportError> {
        let url = self.url_for(request)?;
        let builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };
        let response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(&err))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|err| classify(&err))?;
        let content = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|err| TransportError::MalformedJson {
                status,
                message: err.to_string(),
            })?
        };
        Ok(JsonResponse { status, content })
    }
}

/// Connects with [`HttpTransport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, GatewayError> {
        let transport = HttpTransport::new(endpoint)?;
        tracing::info!(endpoint, base_url = %transport.base_url(), "Connecting to backend");
        Ok(Arc::new(transport))
    }
}
