//! Data Transfer Objects (or structs)
//!
//! These structs serve to serialise and deserialize messages exchanged with
//! the chain daemon and with status consumers; they should be very simple
//! and ideally not contain any business logic.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::models::{BlockHash, HeaderRecord, Height};

/// JSON-RPC 2.0 request envelope sent to the chain daemon.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0", id, method: method.to_string(), params }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC 2.0 response envelope. Exactly one of `result` and `error` is
/// expected to be present.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A block header as reported by the daemon's `getblockheaders` call.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BlockHeaderDto {
    pub height: Height,
    pub hash: BlockHash,
    /// Absent for the genesis block.
    #[serde(rename = "previousblockhash", default)]
    pub prev_hash: Option<BlockHash>,
    #[serde(rename = "time")]
    pub timestamp: u64,
}

impl From<BlockHeaderDto> for HeaderRecord {
    fn from(dto: BlockHeaderDto) -> Self {
        HeaderRecord {
            height: dto.height,
            hash: dto.hash,
            prev_hash: dto.prev_hash.unwrap_or_default(),
            timestamp: dto.timestamp,
        }
    }
}

/// Point-in-time snapshot of one live download task, for status reporting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub name: String,
    pub age_ms: u64,
    pub progress: f64,
}

/// Best-effort snapshot of the sync controller's state, published for
/// introspection. Heights are authoritative only once the controller
/// reports the `up-to-date` phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: String,
    pub local_height: Option<Height>,
    pub remote_height: Option<Height>,
    /// Headers downloaded so far in the current attempt. Not authoritative
    /// until every task of the attempt has completed.
    pub headers_downloaded: u64,
    pub attempt: u64,
    pub tasks: Vec<TaskStatus>,
    pub updated_at: NaiveDateTime,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: "idle".to_string(),
            local_height: None,
            remote_height: None,
            headers_downloaded: 0,
            attempt: 0,
            tasks: Vec::new(),
            updated_at: NaiveDateTime::default(),
        }
    }
}
