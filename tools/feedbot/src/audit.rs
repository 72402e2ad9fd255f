//! Append-only audit trail: one record per action attempt plus a final
//! `RUN_COMPLETE` record per run.

use crate::errors::FeedbotError;
use crate::logging::append_run_log;
use crate::types::{ActionKind, ActionStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp_ms: i64,
    pub action_kind: ActionKind,
    pub status: ActionStatus,
    /// Account the run acts as.
    pub actor: String,
    /// Item id, or the reply target id for replies.
    pub target: Option<String>,
    pub text: Option<String>,
    pub link: Option<String>,
    pub error: Option<String>,
    pub run_id: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), FeedbotError>;
}

/// Emit to `sink`, downgrading a write failure to a run-log warning.
pub fn emit(sink: &dyn AuditSink, record: &AuditRecord) {
    if let Err(err) = sink.record(record) {
        append_run_log(
            "warn",
            "audit.write_failed",
            json!({
                "run_id": record.run_id,
                "action_kind": record.action_kind.as_str(),
                "error": err.to_string(),
            }),
        );
    }
}

pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FeedbotError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FeedbotError::Audit(e.to_string()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>, FeedbotError> {
        read_records(&self.path)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), FeedbotError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| FeedbotError::Audit(e.to_string()))?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FeedbotError::Audit(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| FeedbotError::Audit(e.to_string()))
    }
}

pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>, FeedbotError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|e| FeedbotError::Audit(e.to_string()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| FeedbotError::Audit(format!("malformed audit line: {e}")))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), FeedbotError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub by_kind: BTreeMap<ActionKind, KindSummary>,
    pub runs_completed: u32,
}

impl AuditSummary {
    pub fn kind(&self, kind: ActionKind) -> KindSummary {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }
}

/// Rebuild per-kind attempt counts from the trail. A SKIPPED record is not an
/// attempt: the action was chosen but never reached the driver.
pub fn summarize<'a>(records: impl IntoIterator<Item = &'a AuditRecord>) -> AuditSummary {
    let mut summary = AuditSummary::default();
    for record in records {
        if record.action_kind == ActionKind::RunComplete {
            summary.runs_completed += 1;
            continue;
        }
        let entry = summary.by_kind.entry(record.action_kind).or_default();
        match record.status {
            ActionStatus::Success => {
                entry.attempted += 1;
                entry.succeeded += 1;
            }
            ActionStatus::Failed => {
                entry.attempted += 1;
                entry.failed += 1;
            }
            ActionStatus::Skipped => entry.skipped += 1,
        }
    }
    summary
}
