//! Exchange journal: one JSON line per completed request.
//!
//! Diagnostics go through `tracing`; the journal is the durable record of
//! what was routed where. It keeps the newest entries in memory and appends
//! every entry to a JSONL file.

use crate::error::{ErrorKind, GatewayError};
use crate::router::RouteDecision;
use crate::translate::Dialect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_JOURNAL_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub inbound: Dialect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Dialect>,
    #[serde(default)]
    pub transformed: bool,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExchangeRecord {
    pub fn new(inbound: Dialect) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            inbound,
            backend: None,
            transformed: false,
            model: String::new(),
            upstream_model: None,
            stream: false,
            status: 0,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn routed(&mut self, decision: &RouteDecision) {
        self.backend = Some(decision.backend);
        self.transformed = decision.needs_transform;
        if decision.model != self.model {
            self.upstream_model = Some(decision.model.clone());
        }
    }

    pub fn failed(&mut self, err: &GatewayError) {
        self.status = err.status();
        self.error = Some(err.kind());
    }
}

struct Journal {
    entries: VecDeque<ExchangeRecord>,
    writer: Option<BufWriter<File>>,
    file_path: Option<PathBuf>,
}

impl Journal {
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_JOURNAL_ENTRIES);
        let mut dropped = false;
        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<ExchangeRecord>(&line) {
                    if entries.len() >= MAX_JOURNAL_ENTRIES {
                        entries.pop_front();
                        dropped = true;
                    }
                    entries.push_back(entry);
                }
            }
        }

        let mut journal = Self {
            entries,
            writer: None,
            file_path: Some(file_path.to_path_buf()),
        };
        if dropped {
            journal.compact()?;
        } else {
            journal.writer = Some(append_writer(file_path)?);
        }
        Ok(journal)
    }

    fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            writer: None,
            file_path: None,
        }
    }

    fn record(&mut self, entry: ExchangeRecord) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_JOURNAL_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn recent(&self, limit: usize) -> Vec<ExchangeRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Rewrite the file so it holds only the entries kept in memory.
    fn compact(&mut self) -> std::io::Result<()> {
        let Some(ref path) = self.file_path else {
            return Ok(());
        };
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        self.writer = Some(append_writer(path)?);
        Ok(())
    }
}

fn append_writer(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Shared handle to the journal. Write failures are ignored so a full disk
/// never fails a request.
#[derive(Clone)]
pub struct ExchangeLog(Arc<Mutex<Journal>>);

impl ExchangeLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Journal::open(
            file_path.as_ref(),
        )?))))
    }

    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Journal::in_memory())))
    }

    pub fn record(&self, entry: ExchangeRecord) {
        tracing::debug!(
            request_id = %entry.request_id,
            inbound = %entry.inbound,
            model = %entry.model,
            status = entry.status,
            "Exchange finished"
        );
        if let Ok(mut journal) = self.0.lock() {
            journal.record(entry);
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ExchangeRecord> {
        self.0.lock().map(|j| j.recent(limit)).unwrap_or_default()
    }

    pub fn compact(&self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut journal) => journal.compact(),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, status: u16) -> ExchangeRecord {
        let mut r = ExchangeRecord::new(Dialect::Anthropic);
        r.model = model.to_string();
        r.status = status;
        r
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = ExchangeLog::in_memory();
        log.record(record("a", 200));
        log.record(record("b", 404));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].model, "b");
    }

    #[test]
    fn test_journal_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("exchanges.jsonl");

        let log = ExchangeLog::open(&path).unwrap();
        let mut failed = record("gpt-4o", 0);
        failed.failed(&GatewayError::no_route("gpt-4o"));
        log.record(failed);
        log.record(record("claude-3-5-sonnet", 200));
        log.compact().unwrap();
        drop(log);

        let reopened = ExchangeLog::open(&path).unwrap();
        let recent = reopened.recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].status, 404);
        assert_eq!(recent[1].error, Some(ErrorKind::NoRouteForModel));
    }
}
