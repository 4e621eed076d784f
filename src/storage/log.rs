//! File-backed transaction store
//!
//! Persists write batches to an append-only JSON-lines log so that
//! transaction state can be recovered after a restart. The log is folded
//! into a snapshot once it grows past a threshold.

use super::{BatchOp, StoreStats, TxStore, WriteBatch};
use crate::error::{Result, TabletError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const LOG_FILE: &str = "current.log";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";

/// Default number of batches appended before the log is compacted
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 1024;

/// One line of the log
#[derive(Debug, Serialize, Deserialize)]
struct LogBatch {
    sequence: u64,
    ops: Vec<BatchOp>,
}

/// Contents of the snapshot file
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    sequence: u64,
    entries: BTreeMap<String, Bytes>,
}

/// Append-only batch log with snapshots
#[derive(Debug)]
pub struct FileTxStore {
    /// Directory for log and snapshot files
    dir: PathBuf,
    /// Materialized contents
    data: RwLock<BTreeMap<String, Bytes>>,
    /// Serializes appends so that log order matches apply order
    append_lock: Mutex<()>,
    /// Sequence number of the last appended batch
    sequence: AtomicU64,
    /// Batches appended since the last snapshot
    since_snapshot: AtomicU64,
    compaction_threshold: u64,
    stats: FileTxStoreStats,
}

#[derive(Debug, Default)]
struct FileTxStoreStats {
    reads: AtomicU64,
    batches: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl FileTxStore {
    /// Open (or create) a store in `dir`, replaying the snapshot and log
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_threshold(dir, DEFAULT_COMPACTION_THRESHOLD)
    }

    /// Open with a custom compaction threshold
    pub fn open_with_threshold(dir: &Path, compaction_threshold: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            TabletError::storage_op("create store directory", e)
        })?;

        let snapshot = Self::load_snapshot(dir)?;
        let mut data = snapshot.entries;
        let mut sequence = snapshot.sequence;
        let replayed = Self::replay_log(dir, snapshot.sequence, &mut data, &mut sequence)?;

        info!(
            dir = %dir.display(),
            keys = data.len(),
            sequence,
            replayed,
            "Transaction store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            data: RwLock::new(data),
            append_lock: Mutex::new(()),
            sequence: AtomicU64::new(sequence),
            since_snapshot: AtomicU64::new(replayed),
            compaction_threshold: compaction_threshold.max(1),
            stats: FileTxStoreStats::default(),
        })
    }

    fn load_snapshot(dir: &Path) -> Result<Snapshot> {
        let snapshot_file = dir.join(SNAPSHOT_FILE);
        if !snapshot_file.exists() {
            debug!("No transaction store snapshot found, starting fresh");
            return Ok(Snapshot::default());
        }

        let json = fs::read(&snapshot_file)
            .map_err(|e| TabletError::storage_op("read snapshot", e))?;
        let snapshot: Snapshot = serde_json::from_slice(&json)
            .map_err(|e| TabletError::storage_op("parse snapshot", e))?;

        info!(
            keys = snapshot.entries.len(),
            sequence = snapshot.sequence,
            "Loaded transaction store snapshot"
        );
        Ok(snapshot)
    }

    /// Apply every complete batch after `after_sequence`
    ///
    /// Replay stops at the first line that does not parse. That line and
    /// anything after it is a torn write and is cut from the file so that
    /// new appends start on a clean line.
    fn replay_log(
        dir: &Path,
        after_sequence: u64,
        data: &mut BTreeMap<String, Bytes>,
        sequence: &mut u64,
    ) -> Result<u64> {
        let log_file = dir.join(LOG_FILE);
        if !log_file.exists() {
            return Ok(0);
        }

        let content =
            fs::read(&log_file).map_err(|e| TabletError::storage_op("read log", e))?;

        let mut replayed = 0;
        let mut valid_len = 0usize;
        for line in content.split_inclusive(|b| *b == b'\n') {
            if !line.ends_with(b"\n") {
                warn!(bytes = line.len(), "Dropping torn transaction store log tail");
                break;
            }
            let batch = match serde_json::from_slice::<LogBatch>(line) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted transaction store log tail");
                    break;
                }
            };
            valid_len += line.len();
            if batch.sequence <= after_sequence {
                continue;
            }
            apply_ops(data, batch.ops);
            *sequence = batch.sequence;
            replayed += 1;
        }

        if valid_len < content.len() {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&log_file)
                .map_err(|e| TabletError::storage_op("open log", e))?;
            file.set_len(valid_len as u64)
                .and_then(|_| file.sync_data())
                .map_err(|e| TabletError::storage_op("truncate log", e))?;
        }

        debug!(replayed, "Replayed transaction store log");
        Ok(replayed)
    }

    fn append(&self, batch: &LogBatch) -> Result<()> {
        let mut line = serde_json::to_vec(batch)?;
        line.push(b'\n');

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))
            .and_then(|mut f| {
                f.write_all(&line)?;
                f.sync_data()
            })
            .map_err(|e| TabletError::storage_op("append log", e))
    }

    /// Write a snapshot of the current contents and truncate the log
    pub fn compact(&self) -> Result<()> {
        let _guard = self.append_lock.lock();
        self.compact_locked()
    }

    fn compact_locked(&self) -> Result<()> {
        let snapshot = Snapshot {
            sequence: self.sequence.load(Ordering::Acquire),
            entries: self.data.read().clone(),
        };
        let json = serde_json::to_vec(&snapshot)?;

        // Write to temp file first, then rename for atomicity
        let temp_file = self.dir.join(SNAPSHOT_TMP_FILE);
        fs::write(&temp_file, &json).map_err(|e| TabletError::storage_op("write snapshot", e))?;
        fs::rename(&temp_file, self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| TabletError::storage_op("finalize snapshot", e))?;

        // Batches up to the snapshot sequence are skipped on replay, so a
        // crash between rename and truncate is harmless.
        fs::write(self.dir.join(LOG_FILE), b"")
            .map_err(|e| TabletError::storage_op("truncate log", e))?;
        self.since_snapshot.store(0, Ordering::Release);

        info!(
            keys = snapshot.entries.len(),
            sequence = snapshot.sequence,
            "Transaction store snapshot written"
        );
        Ok(())
    }

    /// Directory holding the store files
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn apply_ops(data: &mut BTreeMap<String, Bytes>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

#[async_trait]
impl TxStore for FileTxStore {
    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.read().get(key).cloned())
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.append_lock.lock();
        let sequence = self.sequence.load(Ordering::Acquire) + 1;
        let entry = LogBatch {
            sequence,
            ops: batch.into_ops(),
        };
        self.append(&entry)?;

        let (puts, deletes) = entry.ops.iter().fold((0, 0), |(p, d), op| match op {
            BatchOp::Put { .. } => (p + 1, d),
            BatchOp::Delete { .. } => (p, d + 1),
        });
        apply_ops(&mut self.data.write(), entry.ops);
        self.sequence.store(sequence, Ordering::Release);

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.puts.fetch_add(puts, Ordering::Relaxed);
        self.stats.deletes.fetch_add(deletes, Ordering::Relaxed);

        if self.since_snapshot.fetch_add(1, Ordering::AcqRel) + 1 >= self.compaction_threshold {
            self.compact_locked()?;
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            puts: self.stats.puts.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
        }
    }
}
