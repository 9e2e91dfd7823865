//! Task capability contract and the concrete header download task.
//!
//! A task is a small state machine, `Created → Started → {Succeeded |
//! Errored} → Finished`, executed by a worker the registry spawns. The
//! driver below enforces the contract: `Started` first, then exactly one of
//! `Succeeded`/`Errored` (neither when cancelled), and `Finished` exactly
//! once, always. The driver races the task body against its cancellation
//! token, so every `.await` in a body (in particular every RPC call) is a
//! cancellation point; bodies need no explicit checks.

use std::sync::Arc;

use async_trait::async_trait;
use lodestone_common::{
    models::{BlockHash, BlockRange, HeaderRecord},
    storage::{HeaderGateway, StorageError},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    rpc::{DaemonRpc, RpcError},
    sync::registry::TaskId,
};

/// Numeric error codes recorded on a failed task.
pub mod codes {
    /// Transient transport failure talking to the daemon; the next poll
    /// retries the attempt after backoff.
    pub const RPC_TRANSIENT: i32 = 10;
    /// The daemon rejected the request outright.
    pub const RPC_REJECTED: i32 = 11;
    /// Downloaded data contradicts local expectations (wrong heights or
    /// broken parent linkage, typically a reorg mid-download).
    pub const DATA_INCONSISTENT: i32 = 20;
    /// The storage collaborator refused or failed the write.
    pub const STORAGE: i32 = 30;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task error {code}: {message}")]
pub struct TaskError {
    pub code: i32,
    pub message: String,
}

impl TaskError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.code == codes::RPC_TRANSIENT
    }
}

impl From<RpcError> for TaskError {
    fn from(err: RpcError) -> Self {
        let code = if err.is_transient() { codes::RPC_TRANSIENT } else { codes::RPC_REJECTED };
        TaskError::new(code, err.to_string())
    }
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        let code = match err {
            StorageError::InvalidAppend { .. } => codes::DATA_INCONSISTENT,
            _ => codes::STORAGE,
        };
        TaskError::new(code, err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskEventKind {
    Started,
    Progress(f64),
    Succeeded,
    Errored(TaskError),
    Finished,
}

/// Delivered into the controller's inbox by the task driver.
#[derive(Clone, Debug)]
pub struct TaskEvent {
    pub id: TaskId,
    pub kind: TaskEventKind,
}

/// Handed to a running task body for progress reporting and cancellation
/// probing.
pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
}

impl TaskContext {
    pub(super) fn new(id: TaskId, cancel: CancellationToken, events: mpsc::Sender<TaskEvent>) -> Self {
        Self { id, cancel, events }
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Best-effort progress report in `[0.0, 1.0]` (or a task-defined
    /// scale). Consumers tolerate missing updates; only the final
    /// succeeded/errored signal is authoritative.
    pub async fn progress(&self, value: f64) {
        self.emit(TaskEventKind::Progress(value)).await;
    }

    async fn emit(&self, kind: TaskEventKind) {
        // a closed inbox means the controller is gone; nothing to do
        let _ = self
            .events
            .send(TaskEvent { id: self.id, kind })
            .await;
    }
}

/// Capability contract every task handed to the registry must satisfy.
/// Handing the registry anything else is rejected at compile time.
#[async_trait]
pub trait SyncTask: Send + 'static {
    fn name(&self) -> String;

    /// Block range this task is responsible for, when it has one. Used for
    /// best-effort progress accounting only.
    fn range(&self) -> Option<BlockRange> {
        None
    }

    async fn run(self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Executes one task under the lifecycle contract described in the module
/// docs.
pub(super) async fn drive<T: SyncTask>(task: T, ctx: TaskContext) {
    ctx.emit(TaskEventKind::Started).await;
    let cancel = ctx.cancel_token();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = task.run(&ctx) => Some(result),
    };
    match outcome {
        Some(Ok(())) => ctx.emit(TaskEventKind::Succeeded).await,
        Some(Err(err)) => {
            debug!(id = %ctx.id, code = err.code, message = %err.message, "task body errored");
            ctx.emit(TaskEventKind::Errored(err)).await;
        }
        None => debug!(id = %ctx.id, "task cancelled before completion"),
    }
    ctx.emit(TaskEventKind::Finished).await;
}

/// Downloads and validates a contiguous range of block headers, committing
/// each validated batch durably before requesting the next one. On success
/// every header in the range has reached storage. Batches committed before
/// an error are left in place; the controller reconciles from the new local
/// height on the next attempt.
pub struct HeaderDownloadTask<R, G> {
    range: BlockRange,
    batch: u64,
    rpc: Arc<R>,
    storage: Arc<G>,
}

impl<R, G> HeaderDownloadTask<R, G> {
    pub fn new(range: BlockRange, batch: u64, rpc: Arc<R>, storage: Arc<G>) -> Self {
        debug_assert!(batch > 0, "batch size must be positive");
        Self { range, batch: batch.max(1), rpc, storage }
    }
}

#[async_trait]
impl<R, G> SyncTask for HeaderDownloadTask<R, G>
where
    R: DaemonRpc + 'static,
    G: HeaderGateway + 'static,
{
    fn name(&self) -> String {
        format!("download-headers {}", self.range)
    }

    fn range(&self) -> Option<BlockRange> {
        Some(self.range)
    }

    async fn run(self, ctx: &TaskContext) -> Result<(), TaskError> {
        let total = self.range.len();
        let mut done = 0u64;
        let mut last_hash: Option<BlockHash> = None;
        let mut next = self.range.start;

        while next < self.range.end {
            let chunk = BlockRange::new(next, (next + self.batch).min(self.range.end));
            trace!(%chunk, "requesting header batch");
            let headers = self.rpc.block_headers(chunk).await?;
            validate_batch(chunk, &headers, last_hash)?;
            last_hash = headers.last().map(|h| h.hash);
            self.storage.append_range(chunk, headers).await?;

            done += chunk.len();
            next = chunk.end;
            ctx.progress(done as f64 / total as f64).await;
        }
        Ok(())
    }
}

fn validate_batch(
    chunk: BlockRange,
    headers: &[HeaderRecord],
    previous_hash: Option<BlockHash>,
) -> Result<(), TaskError> {
    let inconsistent =
        |reason: String| TaskError::new(codes::DATA_INCONSISTENT, format!("{chunk}: {reason}"));

    if headers.len() as u64 != chunk.len() {
        return Err(inconsistent(format!(
            "daemon returned {} headers for {} heights",
            headers.len(),
            chunk.len()
        )));
    }
    let mut expected_parent = previous_hash;
    for (i, header) in headers.iter().enumerate() {
        let height = chunk.start + i as u64;
        if header.height != height {
            return Err(inconsistent(format!(
                "header {} carries height {}, expected {height}",
                i, header.height
            )));
        }
        if let Some(parent) = expected_parent {
            if header.prev_hash != parent {
                return Err(inconsistent(format!("parent hash mismatch at height {height}")));
            }
        }
        expected_parent = Some(header.hash);
    }
    Ok(())
}
