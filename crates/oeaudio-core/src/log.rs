//! Event log
//!
//! One [`SyncEvent`] per line, JSON Lines, append-only. Each record is
//! written with a single `write_all` and synced to disk before `append`
//! returns, so the file always holds a prefix of the session's events.

use crate::sync::event::{SequenceCheck, SyncEvent};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the event log
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Cannot write event log {}: {source}", .path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Event out of order: {0}")]
    OrderViolation(String),

    #[error("Malformed record at {}:{line}: {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Synchronous, ordered writer for the session's event log
pub struct EventLogger {
    path: PathBuf,
    file: File,
    order: SequenceCheck,
    records: usize,
}

impl EventLogger {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), "Event log opened");

        Ok(Self {
            path,
            file,
            order: SequenceCheck::new(),
            records: 0,
        })
    }

    /// Write one event and sync it to disk
    pub fn append(&mut self, event: &SyncEvent) -> Result<(), LogError> {
        self.order.accept(event).map_err(LogError::OrderViolation)?;

        let mut line = serde_json::to_string(event).map_err(|e| self.write_error(e.into()))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| self.write_error(e))?;

        self.records += 1;
        tracing::debug!(record = self.records, event = %event, "Logged");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written by this logger
    pub fn records(&self) -> usize {
        self.records
    }

    fn write_error(&self, source: io::Error) -> LogError {
        LogError::WriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}

/// Parse an event log back into events
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<SyncEvent>, LogError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| LogError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LogError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| LogError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            reason: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}
