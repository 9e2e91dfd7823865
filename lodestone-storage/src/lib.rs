//! Indexed header store.
//!
//! `HeaderStore` keeps the indexed headers in an in-memory height index
//! backed by an append-only JSON-lines journal. Every `append_range` is
//! written and fsynced before it is acknowledged, and the journal is
//! replayed on open. Ranges may arrive out of order (concurrent download
//! tasks commit disjoint spans independently); `current_height` only ever
//! reports the height up to which the index is contiguous from genesis, so
//! a gap is never mistaken for a synced chain.

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use lodestone_common::{
    models::{BlockRange, HeaderRecord, Height},
    storage::{HeaderGateway, StorageError},
};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info};

const JOURNAL_FILE: &str = "headers.jsonl";

struct Inner {
    headers: BTreeMap<Height, HeaderRecord>,
    tip: Option<Height>,
    journal: Option<File>,
}

pub struct HeaderStore {
    inner: Mutex<Inner>,
}

impl HeaderStore {
    /// Store without a journal. Nothing survives a restart; intended for
    /// tests and one-shot runs.
    pub fn in_memory() -> Self {
        Self { inner: Mutex::new(Inner { headers: BTreeMap::new(), tip: None, journal: None }) }
    }

    /// Opens (or creates) the store under `dir`, replaying the journal.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(JOURNAL_FILE);

        let mut headers = BTreeMap::new();
        if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                let record: HeaderRecord = serde_json::from_str(line).map_err(|e| {
                    StorageError::Corrupt(format!("line {}: {e}", lineno + 1))
                })?;
                // later lines win, matching append order
                headers.insert(record.height, record);
            }
        }

        let journal = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        let tip = contiguous_tip(&headers, None);
        info!(
            path = %path.display(),
            n_headers = headers.len(),
            ?tip,
            "header store opened"
        );
        Ok(Self { inner: Mutex::new(Inner { headers, tip, journal: Some(journal) }) })
    }
}

/// Advances `from` (exclusive lower bound on the contiguous span, `None`
/// meaning "check genesis first") as far as the index allows.
fn contiguous_tip(headers: &BTreeMap<Height, HeaderRecord>, from: Option<Height>) -> Option<Height> {
    let mut tip = match from {
        Some(t) => t,
        None => {
            if !headers.contains_key(&0) {
                return None;
            }
            0
        }
    };
    while headers.contains_key(&(tip + 1)) {
        tip += 1;
    }
    Some(tip)
}

fn validate_append(
    range: BlockRange,
    records: &[HeaderRecord],
    stored_parent: Option<&HeaderRecord>,
) -> Result<(), StorageError> {
    let invalid = |reason: String| StorageError::InvalidAppend { range, reason };

    if records.len() as u64 != range.len() {
        return Err(invalid(format!("{} records for {} heights", records.len(), range.len())));
    }
    let mut expected_parent = stored_parent.map(|p| p.hash);
    for (i, record) in records.iter().enumerate() {
        let height = range.start + i as u64;
        if record.height != height {
            return Err(invalid(format!(
                "record {} carries height {}, expected {height}",
                i, record.height
            )));
        }
        if let Some(parent) = expected_parent {
            if record.prev_hash != parent {
                return Err(invalid(format!("parent hash mismatch at height {height}")));
            }
        }
        expected_parent = Some(record.hash);
    }
    Ok(())
}

#[async_trait]
impl HeaderGateway for HeaderStore {
    async fn current_height(&self) -> Result<Option<Height>, StorageError> {
        Ok(self.inner.lock().await.tip)
    }

    async fn append_range(
        &self,
        range: BlockRange,
        records: Vec<HeaderRecord>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let stored_parent = range
            .start
            .checked_sub(1)
            .and_then(|h| inner.headers.get(&h));
        validate_append(range, &records, stored_parent)?;

        if let Some(journal) = inner.journal.as_mut() {
            let mut buf = String::with_capacity(records.len() * 128);
            for record in &records {
                buf.push_str(
                    &serde_json::to_string(record)
                        .map_err(|e| StorageError::Io(e.to_string()))?,
                );
                buf.push('\n');
            }
            journal.write_all(buf.as_bytes()).await?;
            journal.sync_data().await?;
        }

        for record in records {
            inner.headers.insert(record.height, record);
        }
        inner.tip = contiguous_tip(&inner.headers, inner.tip);
        debug!(%range, tip = ?inner.tip, "range committed");
        Ok(())
    }

    async fn header_at(&self, height: Height) -> Result<HeaderRecord, StorageError> {
        self.inner
            .lock()
            .await
            .headers
            .get(&height)
            .cloned()
            .ok_or(StorageError::NotFound(height))
    }
}
