//! The network seam: one request in, one JSON response or a structured failure out.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::ProvidenceConfig;
use crate::fetchable::{QueryParams, UNKNOWN_STATUS};

/// Code carried by failures caused by the request's cancellation signal.
pub const CANCELLED_CODE: &str = "ERR_CANCELED";

/// Code carried by requests that timed out or were aborted by the network.
pub const TIMEOUT_CODE: &str = "ECONNABORTED";

/// Code carried by requests that never produced an HTTP response.
pub const NETWORK_CODE: &str = "ERR_NETWORK";

#[derive(Debug, Clone)]
pub struct NetRequest {
    pub url: String,
    pub method: Method,
    pub data: Option<Value>,
    pub params: Option<QueryParams>,
    pub signal: CancellationToken,
}

impl NetRequest {
    pub fn new(method: Method, url: impl Into<String>, signal: CancellationToken) -> Self {
        Self {
            url: url.into(),
            method,
            data: None,
            params: None,
            signal,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_params(mut self, params: Option<QueryParams>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetResponse {
    pub status: u16,
    pub data: Value,
}

impl NetResponse {
    pub fn ok(data: Value) -> Self {
        Self { status: 200, data }
    }
}

/// A failed network call.
///
/// `code` mirrors transport-level failure codes (cancellation, timeout,
/// unreachable host). `status` and `data` carry the HTTP status and decoded
/// body of error responses.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub data: Option<Value>,
    pub message: String,
}

impl TransportError {
    pub fn cancelled() -> Self {
        Self {
            code: Some(CANCELLED_CODE.to_string()),
            status: None,
            data: None,
            message: "request cancelled".to_string(),
        }
    }

    pub fn http(status: u16, data: Value) -> Self {
        Self {
            code: None,
            status: Some(status),
            data: Some(data),
            message: format!("request failed with status code {status}"),
        }
    }

    pub fn network(code: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            code: Some(code.into()),
            status: None,
            data: None,
            message: message.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code.as_deref() == Some(CANCELLED_CODE)
    }

    /// Failure code if present, otherwise the HTTP status, otherwise `UNKNOWN`.
    pub fn status_label(&self) -> String {
        match (&self.code, self.status) {
            (Some(code), _) => code.clone(),
            (None, Some(status)) => status.to_string(),
            (None, None) => UNKNOWN_STATUS.to_string(),
        }
    }
}

/// Performs network calls on behalf of module tasks.
///
/// Implementations must resolve with a cancelled failure once `signal` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: NetRequest) -> Result<NetResponse, TransportError>;
}

/// [`Transport`] over HTTP with JSON bodies.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &ProvidenceConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                tracing::error!(?e, "HttpTransport: failed to create HTTP client");
                TransportError::network(NETWORK_CODE, format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self::with_client(client, config.base_url.clone()))
    }

    pub fn with_client(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self { client, base_url }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }

    async fn send(&self, request: &NetRequest) -> Result<NetResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.resolve(&request.url));
        if let Some(params) = &request.params {
            builder = builder.query(params);
        }
        if let Some(data) = &request.data {
            builder = builder.json(data);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        let data = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        if status.is_success() {
            Ok(NetResponse {
                status: status.as_u16(),
                data,
            })
        } else {
            Err(TransportError::http(status.as_u16(), data))
        }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::network(TIMEOUT_CODE, error)
    } else {
        TransportError::network(NETWORK_CODE, error)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(name = "providence.transport.call", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn call(&self, request: NetRequest) -> Result<NetResponse, TransportError> {
        let result = tokio::select! {
            biased;
            _ = request.signal.cancelled() => Err(TransportError::cancelled()),
            result = self.send(&request) => result,
        };
        if let Err(error) = &result {
            debug!(code = ?error.code, status = ?error.status, "Request failed");
        }
        result
    }
}
