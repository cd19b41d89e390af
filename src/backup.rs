//! Raw-line backups of the gateway's state dump.
//!
//! Right after a connection opens the gateway sends everything it knows,
//! from its `H:` hello up to the `L:` device list. When a backup is
//! requested those raw lines are captured and written to a JSON-lines file
//! so the gateway can be inspected or restored later.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CubeError, Result};

/// Progress of a requested backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// Nothing to capture
    NoBackup,
    /// Waiting for the next `H:` line
    Requested,
    /// Capturing until the next `L:` line
    InProgress,
}

/// One captured line as stored in the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    /// Gateway the line was received from
    pub hub_id: String,
    /// Reception time (milliseconds since epoch)
    pub ts_millis: i64,
    /// Base64-encoded raw line
    pub line_b64: String,
}

impl BackupRecord {
    pub fn line(&self) -> Option<String> {
        general_purpose::STANDARD
            .decode(&self.line_b64)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

/// Captures raw lines between `H:` and `L:` while a backup is pending.
#[derive(Debug)]
pub struct BackupRecorder {
    hub_id: String,
    state: BackupState,
    stamp: String,
    records: Vec<BackupRecord>,
}

impl BackupRecorder {
    pub fn new(hub_id: impl Into<String>) -> Self {
        Self {
            hub_id: hub_id.into(),
            state: BackupState::NoBackup,
            stamp: String::new(),
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    /// Arms the recorder; the file name carries the time of the request.
    pub fn request(&mut self) {
        self.state = BackupState::Requested;
        self.stamp = chrono::Local::now().format("%Y%m%d-%H%M").to_string();
        self.records.clear();
    }

    /// Feeds one raw line. Returns the captured records once the device
    /// list closing the dump has been seen.
    pub fn observe(&mut self, raw: &str) -> Option<Vec<BackupRecord>> {
        match self.state {
            BackupState::NoBackup => return None,
            BackupState::Requested if raw.starts_with("H:") => {
                self.state = BackupState::InProgress;
            }
            BackupState::Requested => return None,
            BackupState::InProgress => {}
        }
        self.records.push(BackupRecord {
            hub_id: self.hub_id.clone(),
            ts_millis: chrono::Utc::now().timestamp_millis(),
            line_b64: general_purpose::STANDARD.encode(raw.as_bytes()),
        });
        if raw.starts_with("L:") {
            self.state = BackupState::NoBackup;
            return Some(std::mem::take(&mut self.records));
        }
        None
    }

    /// Drops a dump cut short by a closed connection; capturing starts
    /// over at the next `H:` line.
    pub fn abandon(&mut self) {
        if self.state == BackupState::InProgress {
            tracing::debug!(lines = self.records.len(), "Discarding partial backup");
            self.state = BackupState::Requested;
            self.records.clear();
        }
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

enum JournalOp {
    Write { path: PathBuf, records: Vec<BackupRecord> },
    Flush(oneshot::Sender<()>),
}

/// Writes captured dumps below one directory from a background task.
#[derive(Debug, Clone)]
pub struct BackupJournal {
    base_dir: PathBuf,
    tx: mpsc::Sender<JournalOp>,
}

impl BackupJournal {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn spawn(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let (tx, mut rx) = mpsc::channel::<JournalOp>(16);
        let dir = base_dir.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    JournalOp::Write { path, records } => {
                        match write_records(&dir, &path, &records).await {
                            Ok(()) => tracing::info!(
                                path = %path.display(),
                                lines = records.len(),
                                "Backup written"
                            ),
                            Err(e) => tracing::error!(
                                error = %e,
                                path = %path.display(),
                                "Failed to write backup"
                            ),
                        }
                    }
                    JournalOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { base_dir, tx }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, subject: &str, stamp: &str) -> PathBuf {
        self.base_dir.join(format!("{}-{}.jsonl", sanitize(subject), stamp))
    }

    /// Hands `records` to the writer task; they are appended to
    /// `<subject>-<stamp>.jsonl`, whose path is returned.
    pub async fn submit(
        &self,
        subject: &str,
        stamp: &str,
        records: Vec<BackupRecord>,
    ) -> Result<PathBuf> {
        let path = self.path_for(subject, stamp);
        self.tx
            .send(JournalOp::Write { path: path.clone(), records })
            .await
            .map_err(|_| CubeError::ChannelClosed)?;
        Ok(path)
    }

    /// Waits until every previously submitted write has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(JournalOp::Flush(done))
            .await
            .map_err(|_| CubeError::ChannelClosed)?;
        wait.await.map_err(|_| CubeError::ChannelClosed)
    }

    /// Reads a journal back, returning the raw lines in reception order.
    pub async fn load_lines(path: impl AsRef<Path>) -> Result<Vec<String>> {
        let content = fs::read_to_string(path).await?;
        let mut lines = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BackupRecord>(line) {
                Ok(record) => lines.extend(record.line()),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable backup record"),
            }
        }
        Ok(lines)
    }
}

async fn write_records(dir: &Path, path: &Path, records: &[BackupRecord]) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push_str(&line);
        out.push('\n');
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path).await?;
    f.write_all(out.as_bytes()).await?;
    f.sync_data().await
}
