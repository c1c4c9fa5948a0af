// ABOUTME: JSONL audit sink — write chain with isolated failures, size-bounded events,
// ABOUTME: sensitive-key redaction, and numeric-suffix log rotation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AuditConfig;

static SENSITIVE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(token|password|secret|authorization|cookie|api[-_]?key|bearer|credential)s?")
        .expect("valid regex")
});

const MAX_REDACTION_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ToolCreate,
    ToolUpdate,
    ToolDelete,
    ToolEnable,
    ToolDisable,
    ToolExecute,
    AuthDenied,
    AdminDenied,
    SystemAccess,
}

/// A single audit record (spec section 4.6, 6 "audit log format").
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub metadata: Value,
}

#[derive(Serialize)]
struct Envelope<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

#[derive(Serialize)]
struct TruncatedEnvelope {
    timestamp: DateTime<Utc>,
    event_type: &'static str,
    action: &'static str,
    resource: &'static str,
    note: &'static str,
}

/// Appends audit events to a JSONL file, rotating by size. Failures to
/// write never propagate to the caller's request path — a write failure is
/// logged and the chain continues (spec section 4.6, "write chain").
pub struct AuditLogger {
    path: PathBuf,
    config: AuditConfig,
    file: Mutex<Option<File>>,
    bytes_written: AtomicU64,
}

impl AuditLogger {
    pub async fn new(config: AuditConfig) -> Result<Self, std::io::Error> {
        let path = PathBuf::from(&config.path);
        let file = if config.enabled {
            Some(open_append(&path).await?)
        } else {
            None
        };
        let bytes_written = match &file {
            Some(_) => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        };
        Ok(Self {
            path,
            config,
            file: Mutex::new(file),
            bytes_written: AtomicU64::new(bytes_written),
        })
    }

    /// Appends `event`, redacting sensitive keys and truncating the event
    /// if it exceeds `max_event_bytes`. Never returns an error to the
    /// caller; failures are logged and swallowed.
    pub async fn log(&self, event: AuditEvent) {
        if !self.config.enabled {
            return;
        }
        let mut event = event;
        event.metadata = redact(event.metadata, 0);

        let envelope = Envelope {
            timestamp: Utc::now(),
            event: &event,
        };
        let mut line = match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };

        if line.len() > self.config.max_event_bytes {
            line = serde_json::to_string(&TruncatedEnvelope {
                timestamp: envelope.timestamp,
                event_type: "system_access",
                action: "audit_event_truncated",
                resource: "audit_log",
                note: "event exceeded max_event_bytes and was dropped",
            })
            .unwrap_or_else(|_| "{}".to_owned());
        }
        line.push('\n');

        if let Err(e) = self.write_line(&line).await {
            warn!(error = %e, "audit write failed");
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), std::io::Error> {
        self.maybe_rotate(line.len() as u64).await?;
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        file.write_all(line.as_bytes()).await?;
        self.bytes_written.fetch_add(line.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn maybe_rotate(&self, incoming_len: u64) -> Result<(), std::io::Error> {
        if self.bytes_written.load(Ordering::SeqCst) + incoming_len <= self.config.max_file_bytes {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        *guard = None;
        rotate_files(&self.path, self.config.max_files).await?;
        let fresh = open_append(&self.path).await?;
        *guard = Some(fresh);
        self.bytes_written.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes the current file handle to disk (called during graceful
    /// shutdown, per spec section 4.5).
    pub async fn flush(&self) -> Result<(), std::io::Error> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<File, std::io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Renames `file -> file.1`, `file.1 -> file.2`, ..., dropping anything
/// beyond `max_files` (spec section 4.6, "rotation").
async fn rotate_files(path: &Path, max_files: usize) -> Result<(), std::io::Error> {
    if max_files == 0 {
        return tokio::fs::remove_file(path).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        });
    }
    let oldest = numbered_path(path, max_files);
    if tokio::fs::metadata(&oldest).await.is_ok() {
        tokio::fs::remove_file(&oldest).await?;
    }
    for i in (1..max_files).rev() {
        let from = numbered_path(path, i);
        let to = numbered_path(path, i + 1);
        if tokio::fs::metadata(&from).await.is_ok() {
            tokio::fs::rename(&from, &to).await?;
        }
    }
    let first = numbered_path(path, 1);
    if tokio::fs::metadata(path).await.is_ok() {
        tokio::fs::rename(path, &first).await?;
    }
    Ok(())
}

fn numbered_path(path: &Path, n: usize) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

/// Recursively walks a JSON value, replacing the value of any object key
/// matching the sensitive-key grammar with `"[REDACTED]"`, bounded to
/// `MAX_REDACTION_DEPTH` to guard against pathological nesting (spec
/// section 9, "sensitive redaction").
fn redact(value: Value, depth: usize) -> Value {
    if depth >= MAX_REDACTION_DEPTH {
        return value;
    }
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE_KEY_RE.is_match(&k) {
                    out.insert(k, Value::String("[REDACTED]".to_owned()));
                } else {
                    out.insert(k, redact(v, depth + 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| redact(v, depth + 1)).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> AuditConfig {
        AuditConfig {
            enabled: true,
            path: dir.join("audit.log").to_string_lossy().into_owned(),
            max_event_bytes: 4096,
            max_file_bytes: 200,
            max_files: 2,
        }
    }

    fn event() -> AuditEvent {
        AuditEvent {
            event_type: AuditEventType::ToolCreate,
            actor: Some("admin".into()),
            session_id: Some("sess-1".into()),
            action: "tool_create".into(),
            resource: "dynamic.greeter".into(),
            metadata: serde_json::json!({"password": "hunter2", "nested": {"api_key": "xyz"}}),
        }
    }

    #[tokio::test]
    async fn redacts_sensitive_keys_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(config(dir.path())).await.unwrap();
        logger.log(event()).await;
        logger.flush().await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("audit.log")).await.unwrap();
        assert!(contents.contains("[REDACTED]"));
        assert!(!contents.contains("hunter2"));
        assert!(!contents.contains("xyz"));
    }

    #[test]
    fn sensitive_key_pattern_matches_compound_keys() {
        assert!(SENSITIVE_KEY_RE.is_match("client_secret"));
        assert!(SENSITIVE_KEY_RE.is_match("access_token"));
        assert!(SENSITIVE_KEY_RE.is_match("oldPassword"));
        assert!(!SENSITIVE_KEY_RE.is_match("name"));
    }

    #[tokio::test]
    async fn rotates_when_file_exceeds_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(config(dir.path())).await.unwrap();
        for _ in 0..10 {
            logger.log(event()).await;
        }
        logger.flush().await.unwrap();
        assert!(tokio::fs::metadata(dir.path().join("audit.log.1")).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_logger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.enabled = false;
        let logger = AuditLogger::new(cfg).await.unwrap();
        logger.log(event()).await;
        assert!(tokio::fs::metadata(dir.path().join("audit.log")).await.is_err());
    }
}
