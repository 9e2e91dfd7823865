//! # Daemon RPC client
//!
//! Thin JSON-RPC client for the chain daemon the indexer follows. The
//! [`DaemonRpc`] trait is the capability the sync core consumes; the HTTP
//! implementation below retries transient transport failures with an
//! exponential backoff before surfacing an error to its caller.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
#[cfg(test)]
use mockall::automock;
use lodestone_common::{
    dto::{BlockHeaderDto, JsonRpcRequest, JsonRpcResponse},
    models::{BlockRange, HeaderRecord, Height},
};
use reqwest::{Client, ClientBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug)]
pub enum RpcError {
    /// The configured daemon url failed to parse.
    #[error("failed to parse daemon url {0}: {1}")]
    UrlParsing(String, String),

    /// Errors forwarded from the HTTP transport.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The daemon could not be reached at all.
    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    /// The daemon answered with a JSON-RPC error object.
    #[error("daemon error {code}: {message}")]
    Daemon { code: i64, message: String },

    /// The response from the daemon could not be parsed.
    #[error("failed to parse response: {0}")]
    ParseResponse(String),
}

impl RpcError {
    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::Unreachable(_) => true,
            RpcError::Daemon { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

/// Capability the sync core uses to talk to the chain daemon. The daemon
/// serializes or pools its own connections; callers treat this as a shared
/// capability without external locking.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    /// Height of the daemon's best chain tip.
    async fn tip_height(&self) -> Result<Height, RpcError>;

    /// Headers covering `range`, in ascending height order.
    async fn block_headers(&self, range: BlockRange) -> Result<Vec<HeaderRecord>, RpcError>;
}

#[derive(Debug)]
pub struct HttpDaemonRpc {
    http: Client,
    url: Url,
    request_id: AtomicU64,
    retry: ExponentialBackoff,
}

impl HttpDaemonRpc {
    pub fn new(url: &str) -> Result<Self, RpcError> {
        let retry = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        Self::with_retry(url, retry)
    }

    pub fn with_retry(url: &str, retry: ExponentialBackoff) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::UrlParsing(url.to_string(), e.to_string()))?;
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(RpcError::Transport)?;
        Ok(Self { http, url, request_id: AtomicU64::new(0), retry })
    }

    async fn call<T: DeserializeOwned + Default>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        backoff::future::retry(self.retry.clone(), || async {
            let response = self
                .http
                .post(self.url.clone())
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    let err = if e.is_connect() {
                        RpcError::Unreachable(e.to_string())
                    } else {
                        RpcError::Transport(e)
                    };
                    warn!(%err, method = %request.method, "daemon request failed, retrying");
                    backoff::Error::transient(err)
                })?;

            if response.status().is_server_error() {
                let err = RpcError::Daemon {
                    code: i64::from(response.status().as_u16()),
                    message: response.status().to_string(),
                };
                warn!(%err, method = %request.method, "daemon request failed, retrying");
                return Err(backoff::Error::transient(err));
            }

            let parsed: JsonRpcResponse<T> = response
                .json()
                .await
                .map_err(|e| backoff::Error::permanent(RpcError::ParseResponse(e.to_string())))?;

            match (parsed.result, parsed.error) {
                (_, Some(err)) => Err(backoff::Error::permanent(RpcError::Daemon {
                    code: err.code,
                    message: err.message,
                })),
                (Some(result), None) => Ok(result),
                (None, None) => Err(backoff::Error::permanent(RpcError::ParseResponse(
                    "response carried neither result nor error".to_string(),
                ))),
            }
        })
        .await
    }
}

#[async_trait]
impl DaemonRpc for HttpDaemonRpc {
    async fn tip_height(&self) -> Result<Height, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_headers(&self, range: BlockRange) -> Result<Vec<HeaderRecord>, RpcError> {
        trace!(%range, "requesting headers");
        let headers: Vec<BlockHeaderDto> = self
            .call("getblockheaders", json!([range.start, range.len()]))
            .await?;
        Ok(headers.into_iter().map(HeaderRecord::from).collect())
    }
}
