//! Append-only JSON-lines audit log, one file per session

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::models::{LogEntry, SessionScope};
use crate::error::{ContextError, Result};

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    sync_writes: bool,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            dir: dir.into(),
            sync_writes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<session>.jsonl`; ids are restricted to a safe character set
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !session_id.starts_with('.');
        if !valid {
            return Err(ContextError::Configuration(format!(
                "invalid session id '{}'",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.jsonl", session_id)))
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(session_id)?).await?)
    }

    /// Append one entry as a single line
    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        let path = self.path_for(&entry.session_id)?;
        fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        if self.sync_writes {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// All entries in order. A torn final line is dropped; corruption
    /// elsewhere is an error.
    pub async fn read(&self, session_id: &str) -> Result<Vec<LogEntry>> {
        let path = self.path_for(session_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() => {
                    warn!("Dropping torn final log line for session {}: {}", session_id, e);
                }
                Err(e) => {
                    return Err(ContextError::Storage(format!(
                        "corrupt log entry {} for session {}: {}",
                        i + 1,
                        session_id,
                        e
                    )))
                }
            }
        }
        Ok(entries)
    }

    /// Rebuild a session's scope. Returns the scope and the next sequence number.
    pub async fn replay(&self, session_id: &str) -> Result<(SessionScope, u64)> {
        let entries = self.read(session_id).await?;
        let mut scope = SessionScope::new(session_id);
        let mut next_seq = 0;
        for entry in &entries {
            if entry.seq < next_seq {
                return Err(ContextError::Storage(format!(
                    "log for session {} is out of order at seq {}",
                    session_id, entry.seq
                )));
            }
            scope.apply(&entry.event)?;
            next_seq = entry.seq + 1;
        }
        Ok((scope, next_seq))
    }
}
