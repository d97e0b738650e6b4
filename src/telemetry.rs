use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

const RUN_LOG_PREFIX: &str = "run-";
const RUN_LOG_EXTENSION: &str = "jsonl";

/// Lookup diagnostics, one JSONL log per run.
///
/// Emitting only queues the event in memory, so workers can report from
/// inside a lookup. `flush` appends the queue to this run's log on the
/// blocking pool and then applies retention to earlier logs. Events carry a
/// hash of the address query, never the address itself.
#[derive(Clone)]
pub struct DiagnosticsSink {
    run: Option<Arc<RunLog>>,
}

struct RunLog {
    path: PathBuf,
    pending: Mutex<Pending>,
    retention: Retention,
}

#[derive(Default)]
struct Pending {
    events: Vec<DiagnosticEvent>,
    recorded: u64,
}

#[derive(Debug, Clone, Copy)]
struct Retention {
    max_bytes: u64,
    max_logs: usize,
}

impl DiagnosticsSink {
    pub fn new<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{RUN_LOG_PREFIX}{}.{RUN_LOG_EXTENSION}",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ")
        ));
        debug!(path = %path.display(), "diagnostics enabled");

        Ok(Self {
            run: Some(Arc::new(RunLog {
                path,
                pending: Mutex::new(Pending::default()),
                retention: Retention {
                    max_bytes: config.diagnostics_retain_bytes,
                    max_logs: config.diagnostics_retain_runs.max(1),
                },
            })),
        })
    }

    pub fn disabled() -> Self {
        Self { run: None }
    }

    pub fn emit(&self, name: &str, payload: Value) {
        let Some(run) = &self.run else {
            return;
        };
        let mut pending = run.pending.lock();
        let seq = pending.recorded;
        pending.recorded += 1;
        pending.events.push(DiagnosticEvent::new(seq, name, payload));
    }

    pub fn pending(&self) -> usize {
        self.run
            .as_ref()
            .map_or(0, |run| run.pending.lock().events.len())
    }

    /// Log file for this run; `None` when diagnostics are off.
    pub fn log_path(&self) -> Option<&Path> {
        self.run.as_ref().map(|run| run.path.as_path())
    }

    /// Writes every queued event and returns how many were written.
    ///
    /// On a write failure the events go back to the front of the queue.
    pub async fn flush(&self) -> AppResult<usize> {
        let Some(run) = &self.run else {
            return Ok(0);
        };
        let events = std::mem::take(&mut run.pending.lock().events);
        if events.is_empty() {
            return Ok(0);
        }

        let writer = Arc::clone(run);
        let written = tokio::task::spawn_blocking(move || match writer.append(&events) {
            Ok(()) => {
                if let Err(err) = writer.prune() {
                    warn!(?err, "failed to prune old diagnostics logs");
                }
                Ok(events.len())
            }
            Err(err) => Err((err, events)),
        })
        .await?;

        match written {
            Ok(count) => Ok(count),
            Err((err, events)) => {
                let mut pending = run.pending.lock();
                let newer = std::mem::replace(&mut pending.events, events);
                pending.events.extend(newer);
                Err(err)
            }
        }
    }
}

impl RunLog {
    fn append(&self, events: &[DiagnosticEvent]) -> AppResult<()> {
        let mut lines = Vec::new();
        for event in events {
            serde_json::to_writer(&mut lines, event)?;
            lines.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&lines)?;
        Ok(())
    }

    /// Deletes the oldest earlier run logs until both retention limits hold.
    /// The current run's log is never removed.
    fn prune(&self) -> AppResult<usize> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut earlier = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path != self.path && is_run_log(&path) {
                earlier.push((path, entry.metadata()?.len()));
            }
        }
        // Names embed the start time.
        earlier.sort();

        let mut logs = earlier.len() + 1;
        let mut bytes = fs::metadata(&self.path).map_or(0, |meta| meta.len())
            + earlier.iter().map(|(_, len)| len).sum::<u64>();
        let mut removed = 0;
        for (path, len) in earlier {
            if logs <= self.retention.max_logs && bytes <= self.retention.max_bytes {
                break;
            }
            fs::remove_file(&path)?;
            logs -= 1;
            bytes -= len;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "pruned diagnostics logs");
        }
        Ok(removed)
    }
}

fn is_run_log(path: &Path) -> bool {
    let named = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with(RUN_LOG_PREFIX))
        .unwrap_or(false);
    named && path.extension().is_some_and(|ext| ext == RUN_LOG_EXTENSION)
}

#[derive(Debug, Serialize)]
pub struct DiagnosticEvent {
    pub seq: u64,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl DiagnosticEvent {
    fn new(seq: u64, name: &str, payload: Value) -> Self {
        Self {
            seq,
            name: name.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Stable, non-reversible identifier for an address query.
pub fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_ascii_lowercase().as_bytes());
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// Payload shared by every per-lookup event.
pub fn lookup_payload(index: usize, query: &str, attempt: u32, detail: Option<&str>) -> Value {
    json!({
        "index": index,
        "query_hash": query_hash(query),
        "attempt": attempt,
        "detail": detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> AppConfig {
        AppConfig {
            diagnostics_retain_bytes: 1024 * 1024,
            diagnostics_retain_runs: 3,
            ..AppConfig::default()
        }
    }

    fn read_seqs(path: &Path) -> Vec<u64> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).unwrap()["seq"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn queues_until_flush_and_hashes_queries() {
        let dir = tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path(), &test_config()).unwrap();
        sink.emit(
            "lookup_not_found",
            lookup_payload(3, "Sydney, NSW, 2000", 1, None),
        );

        let log = sink.log_path().unwrap().to_path_buf();
        assert_eq!(sink.pending(), 1);
        assert!(!log.exists());

        assert_eq!(sink.flush().await.unwrap(), 1);
        assert_eq!(sink.pending(), 0);
        let buffer = fs::read_to_string(&log).unwrap();
        assert!(buffer.contains("lookup_not_found"));
        assert!(buffer.contains(&query_hash("Sydney, NSW, 2000")));
        assert!(!buffer.contains("Sydney"));

        assert_eq!(sink.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_sink_drops_events() {
        let sink = DiagnosticsSink::disabled();
        sink.emit("ignored", json!({ "a": 1 }));
        assert_eq!(sink.pending(), 0);
        assert!(sink.log_path().is_none());
        assert_eq!(sink.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_emitters_get_distinct_sequence_numbers() {
        let dir = tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path(), &test_config()).unwrap();

        let handles = (0..8)
            .map(|worker| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        sink.emit("lookup_attempt_failed", json!({ "worker": worker, "i": i }));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.flush().await.unwrap(), 200);

        let seqs = read_seqs(sink.log_path().unwrap());
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn keeps_only_the_newest_run_logs() {
        let dir = tempdir().unwrap();
        for day in ["20240101", "20240102", "20240103"] {
            fs::write(dir.path().join(format!("run-{day}T000000000Z.jsonl")), "{}\n").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let config = AppConfig {
            diagnostics_retain_runs: 2,
            ..test_config()
        };
        let sink = DiagnosticsSink::new(dir.path(), &config).unwrap();
        sink.emit("run_start", json!({}));
        sink.flush().await.unwrap();

        let mut names = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "notes.txt");
        assert_eq!(names[1], "run-20240103T000000000Z.jsonl");
        assert!(sink.log_path().unwrap().exists());
    }

    #[tokio::test]
    async fn byte_budget_never_removes_current_run() {
        let dir = tempdir().unwrap();
        let older = dir.path().join("run-20240101T000000000Z.jsonl");
        fs::write(&older, "{}\n").unwrap();

        let config = AppConfig {
            diagnostics_retain_bytes: 16,
            ..test_config()
        };
        let sink = DiagnosticsSink::new(dir.path(), &config).unwrap();
        sink.emit("run_summary", json!({ "survivors": 0, "excluded": 12 }));
        sink.flush().await.unwrap();

        assert!(!older.exists());
        assert!(sink.log_path().unwrap().exists());
    }

    #[tokio::test]
    async fn failed_write_requeues_events_in_order() {
        let root = tempdir().unwrap();
        let dir = root.path().join("diag");
        let sink = DiagnosticsSink::new(&dir, &test_config()).unwrap();
        sink.emit("first", json!({}));
        sink.emit("second", json!({}));

        fs::remove_dir_all(&dir).unwrap();
        fs::write(&dir, "not a directory").unwrap();
        assert!(sink.flush().await.is_err());
        assert_eq!(sink.pending(), 2);

        fs::remove_file(&dir).unwrap();
        fs::create_dir(&dir).unwrap();
        sink.emit("third", json!({}));
        assert_eq!(sink.flush().await.unwrap(), 3);
        assert_eq!(read_seqs(sink.log_path().unwrap()), vec![0, 1, 2]);
    }

    #[test]
    fn query_hash_ignores_case_and_padding() {
        assert_eq!(query_hash(" Sydney, NSW, 2000 "), query_hash("sydney, nsw, 2000"));
        assert_ne!(query_hash("Sydney, NSW, 2000"), query_hash("Perth, WA, 6000"));
    }
}
