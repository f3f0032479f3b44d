//! Persisted queue task format
//!
//! One JSON file per task. The same shape serves both the update queue and
//! the forget queue, discriminated by `kind`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::stable_hash_hex16;

/// Queue discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Update,
    Forget,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Update => "update",
            TaskKind::Forget => "forget",
        }
    }
}

/// On-disk task record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub kind: TaskKind,
    pub id: String,
    /// Serialization key: `{ns}::{sessionId}` or `{ns}::ids::<hash>`
    pub key: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    pub created_at: String,
    pub attempt: u32,
    /// Epoch millis before which the scheduler must not pick the task up
    pub next_run_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "messages_gzip_base64", skip_serializing_if = "Option::is_none")]
    pub messages_gzip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<String>>,
    /// Per-backend outcomes recorded by forget workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl QueueTask {
    /// Update-index task for one session transcript
    pub fn update(
        namespace: &str,
        session_id: &str,
        transcript_hash: String,
        message_count: usize,
        messages_gzip: String,
        not_before_ms: u64,
    ) -> Self {
        Self {
            kind: TaskKind::Update,
            id: Uuid::new_v4().to_string(),
            key: format!("{}::{}", namespace, session_id),
            namespace: namespace.to_string(),
            session_id: Some(session_id.to_string()),
            memory_ids: None,
            transcript_hash: Some(transcript_hash),
            message_count: Some(message_count),
            created_at: chrono::Utc::now().to_rfc3339(),
            attempt: 0,
            next_run_at: not_before_ms,
            last_error: None,
            messages_gzip: Some(messages_gzip),
            message_ids: None,
            result: None,
        }
    }

    /// Forget task deleting a whole session's memories
    pub fn forget_session(namespace: &str, session_id: &str) -> Self {
        Self {
            kind: TaskKind::Forget,
            id: Uuid::new_v4().to_string(),
            key: format!("{}::{}", namespace, session_id),
            namespace: namespace.to_string(),
            session_id: Some(session_id.to_string()),
            memory_ids: None,
            transcript_hash: None,
            message_count: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            attempt: 0,
            next_run_at: 0,
            last_error: None,
            messages_gzip: None,
            message_ids: None,
            result: None,
        }
    }

    /// Forget task deleting an explicit id set. The key hashes the sorted id
    /// list so identical requests coalesce.
    pub fn forget_ids(namespace: &str, memory_ids: Vec<String>) -> Self {
        let mut sorted = memory_ids.clone();
        sorted.sort();
        let id_hash = stable_hash_hex16(&sorted.join(","));
        Self {
            kind: TaskKind::Forget,
            id: Uuid::new_v4().to_string(),
            key: format!("{}::ids::{}", namespace, id_hash),
            namespace: namespace.to_string(),
            session_id: None,
            memory_ids: Some(memory_ids),
            transcript_hash: None,
            message_count: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            attempt: 0,
            next_run_at: 0,
            last_error: None,
            messages_gzip: None,
            message_ids: None,
            result: None,
        }
    }

    /// File name: `{keyHash16}-{epochMs}-{uuid}.json`. Sorting groups a
    /// key's files together in time order.
    pub fn file_name(&self, epoch_ms: u64) -> String {
        format!(
            "{}-{:013}-{}.json",
            stable_hash_hex16(&self.key),
            epoch_ms,
            self.id
        )
    }

    /// Exact decoded byte length of the gzip payload, if any
    pub fn gzip_len(&self) -> usize {
        match &self.messages_gzip {
            Some(b64) => {
                let padding = b64.bytes().rev().take_while(|&b| b == b'=').count();
                (b64.len() / 4) * 3 - padding
            }
            None => 0,
        }
    }

    /// Copy with the bulky transcript payload removed, for admin listings
    pub fn without_payload(&self) -> Self {
        let mut stripped = self.clone();
        stripped.messages_gzip = None;
        stripped
    }
}
