use crate::errors::FeedbotError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;
/// The disk budget is checked on the first append and then once per this many.
pub const BUDGET_CHECK_INTERVAL: u64 = 256;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
    /// Shared by clones, so the global slot counts every append.
    appends: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            appends: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), FeedbotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| FeedbotError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let mut line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| FeedbotError::Io(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FeedbotError::Io(e.to_string()))?;
        // One write per line so concurrent runs never interleave partial lines.
        file.write_all(line.as_bytes())
            .map_err(|e| FeedbotError::Io(e.to_string()))?;

        if self.appends.fetch_add(1, Ordering::Relaxed) % BUDGET_CHECK_INTERVAL == 0 {
            if let Some(parent) = self.path.parent() {
                let _ = enforce_total_budget(parent, &self.path, self.budget_bytes)?;
            }
        }

        Ok(())
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route `append_run_log` to `logger` for the rest of the process.
pub fn init_run_logger(logger: JsonlLogger) -> Result<(), FeedbotError> {
    if let Some(parent) = logger.path.parent() {
        fs::create_dir_all(parent).map_err(|e| FeedbotError::Io(e.to_string()))?;
    }
    *logger_slot().lock().unwrap_or_else(PoisonError::into_inner) = Some(logger);
    Ok(())
}

/// Best-effort diagnostic event. A no-op until `init_run_logger` is called;
/// write failures are swallowed so logging never changes control flow.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(logger) = logger {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

pub fn structured_fallback_line(run_id: &str, state: &str, message: &str) -> String {
    format!(
        "run_id={run_id} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

/// Delete the oldest `.jsonl` files in `dir` until their total size fits
/// `budget_bytes`. `active` is never removed, even if it alone exceeds the budget.
pub fn enforce_total_budget(
    dir: &Path,
    active: &Path,
    budget_bytes: u64,
) -> Result<Vec<PathBuf>, FeedbotError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| FeedbotError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect::<Vec<_>>();

    files.sort_by(|a, b| {
        let ma = fs::metadata(a).ok().and_then(|m| m.modified().ok());
        let mb = fs::metadata(b).ok().and_then(|m| m.modified().ok());
        ma.cmp(&mb)
    });

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        let len = fs::metadata(&path)
            .map_err(|e| FeedbotError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| FeedbotError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
