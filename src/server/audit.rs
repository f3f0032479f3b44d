//! Append-only audit log
//!
//! Forget and queue-admin actions are appended as JSON Lines to the
//! configured path. Entries carry the requester's key id (a short hash),
//! never the raw API key. Writing is best-effort: an unwritable log is
//! reported once per failure and does not fail the request.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

/// One audit line
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub requester: Requester,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Requester {
    pub key_id: String,
}

impl AuditEntry {
    pub fn new(action: &str, namespace: &str, key_id: &str) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            action: action.to_string(),
            namespace: namespace.to_string(),
            session_id: None,
            memory_ids: None,
            dry_run: None,
            request_id: None,
            requester: Requester {
                key_id: key_id.to_string(),
            },
            detail: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(String::from);
        self
    }

    pub fn with_memory_ids(mut self, ids: Option<&[String]>) -> Self {
        self.memory_ids = ids.map(|ids| ids.to_vec());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// JSON Lines audit writer; a `None` path disables it
pub struct AuditLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn append(&self, entry: AuditEntry) {
        let Some(ref path) = self.path else {
            return;
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit entry serialization failed: {}", e);
                return;
            }
        };
        let _guard = self.write_lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = result {
            tracing::warn!("audit append to {} failed: {}", path.display(), e);
        }
    }
}
