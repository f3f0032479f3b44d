//! Core types for the deep-memory server

use serde::{Deserialize, Serialize};

/// Cap on entities/topics attached to a single memory
pub const MAX_TAG_ITEMS: usize = 10;

/// Cap on a graph node key length
pub const MAX_GRAPH_KEY_LEN: usize = 240;

/// Separator between a namespace and the local part of an id
pub const NS_SEP: &str = "::";

/// Memory kind. Ephemerals carry an `expires_at` and age out of retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    Fact,
    Preference,
    Rule,
    Task,
    Ephemeral,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Preference => "preference",
            MemoryKind::Rule => "rule",
            MemoryKind::Task => "task",
            MemoryKind::Ephemeral => "ephemeral",
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fact" => Ok(MemoryKind::Fact),
            "preference" => Ok(MemoryKind::Preference),
            "rule" => Ok(MemoryKind::Rule),
            "task" => Ok(MemoryKind::Task),
            "ephemeral" => Ok(MemoryKind::Ephemeral),
            _ => Err(format!("Unknown memory kind: {}", s)),
        }
    }
}

/// One chat message of an ingested transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Vector store payload. Exactly these keys are written and read back;
/// the graph store's memory node carries the same fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryPayload {
    pub id: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub content: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_transcript_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_count: Option<usize>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub importance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl MemoryPayload {
    /// Most recent touch timestamp: `updated_at` falling back to `created_at`
    pub fn last_seen_at(&self) -> Option<&str> {
        self.updated_at.as_deref().or(if self.created_at.is_empty() {
            None
        } else {
            Some(self.created_at.as_str())
        })
    }
}

/// A scored ANN hit returned by the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Option<MemoryPayload>,
}

/// ANN search request. Adapters add `with_payload: true` and a must-match
/// namespace filter on the wire.
#[derive(Debug, Clone)]
pub struct VectorSearchRequest {
    pub vector: Vec<f32>,
    pub limit: usize,
    pub score_threshold: f32,
    pub namespace: String,
}

/// Graph relation expansion query
#[derive(Debug, Clone)]
pub struct RelatedQuery {
    pub namespace: String,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub limit: usize,
}

/// One record from the graph relation query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedRecord {
    pub id: String,
    pub content: String,
    pub importance: f32,
    pub frequency: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
    pub relation_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Raw analyzer signals attached to a draft
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftSignals {
    #[serde(default)]
    pub frequency: f32,
    #[serde(default)]
    pub user_intent: f32,
    #[serde(default)]
    pub length: usize,
}

/// Candidate memory produced by the transcript analyzer, prior to
/// importance scoring and sensitivity filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub created_at: String,
    #[serde(default)]
    pub signals: DraftSignals,
}

/// Typed entity reference from the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub name: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
}

fn default_entity_type() -> String {
    "other".to_string()
}

/// Detected event from the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRef {
    pub event_type: String,
    pub ts: String,
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

/// Analyzer input
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub max_memories: usize,
    pub importance_threshold: f32,
}

/// Analyzer output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<EntityRef>,
    #[serde(default)]
    pub events: Vec<EventRef>,
    #[serde(default)]
    pub drafts: Vec<Draft>,
    #[serde(default)]
    pub filtered: usize,
}

impl Analysis {
    /// Resolve an entity's type by name, defaulting to "other"
    pub fn entity_type_of(&self, name: &str) -> &str {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.entity_type.as_str())
            .unwrap_or("other")
    }
}

/// Ingest markers stored on the session node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionIngestMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transcript_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ingested_at: Option<String>,
}

// ============================================================================
// Wire contracts
// ============================================================================

/// `POST /retrieve_context` request body
#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub user_input: String,
    pub session_id: String,
    #[serde(default)]
    pub max_memories: Option<usize>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// One memory in a retrieve response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub id: String,
    pub content: String,
    pub importance: f32,
    pub relevance: f32,
    pub semantic_score: f32,
    pub relation_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub sources: Vec<String>,
}

/// `POST /retrieve_context` response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub memories: Vec<RetrievedMemory>,
    pub context: String,
}

/// `POST /update_memory_index` request body
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "async", default = "default_true")]
    pub async_mode: bool,
}

fn default_true() -> bool {
    true
}

/// Update pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Processed,
    Skipped,
    Queued,
    Error,
}

/// Degradation details attached when backlog policies delay an update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedInfo {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
}

/// `POST /update_memory_index` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status: UpdateStatus,
    pub memories_added: usize,
    pub memories_filtered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<DegradedInfo>,
}

impl UpdateResponse {
    pub fn skipped(reason: &str) -> Self {
        Self {
            status: UpdateStatus::Skipped,
            memories_added: 0,
            memories_filtered: 0,
            error: Some(reason.to_string()),
            degraded: None,
        }
    }

    pub fn queued() -> Self {
        Self {
            status: UpdateStatus::Queued,
            memories_added: 0,
            memories_filtered: 0,
            error: None,
            degraded: None,
        }
    }
}

/// `POST /forget` request body
#[derive(Debug, Clone, Deserialize)]
pub struct ForgetRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub memory_ids: Option<Vec<String>>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(rename = "async", default)]
    pub async_mode: bool,
}

/// Per-backend outcome of a delete; values are counts or error strings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_session: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_ids: Option<serde_json::Value>,
}

/// Pending-queue cancellation outcome attached to a forget result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCancelOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dual-delete results grouped by backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgetResults {
    pub qdrant: DeleteOutcome,
    pub neo4j: DeleteOutcome,
    pub queue: QueueCancelOutcome,
}

/// `POST /forget` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgetResponse {
    pub status: String,
    pub namespace: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_ids: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ForgetResults>,
}

// ============================================================================
// Id and graph-key construction
// ============================================================================

/// Qualify a local memory id with its namespace unless already qualified
pub fn qualify_id(namespace: &str, raw: &str) -> String {
    if raw.contains(NS_SEP) {
        raw.to_string()
    } else {
        format!("{}{}{}", namespace, NS_SEP, raw)
    }
}

/// Namespace prefix of a qualified id, if any
pub fn namespace_of_id(id: &str) -> Option<&str> {
    id.split_once(NS_SEP).map(|(ns, _)| ns).filter(|ns| !ns.is_empty())
}

/// Graph key for a session node
pub fn session_node_id(namespace: &str, session_id: &str) -> String {
    format!("{}::session::{}", namespace, session_id)
}

/// Session id back out of a session node key
pub fn session_from_node_id(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once("::session::")?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Graph key for a topic node
pub fn topic_node_id(namespace: &str, name: &str) -> String {
    format!("{}::topic::{}", namespace, name)
}

/// Graph key for a typed entity node
pub fn entity_node_id(namespace: &str, entity_type: &str, name: &str) -> String {
    format!("{}::entity::{}::{}", namespace, entity_type, name)
}

/// Graph key for an event node, truncated to the key cap
pub fn event_node_id(namespace: &str, event_type: &str, ts: &str, summary: &str) -> String {
    let key = format!("{}::event::{}::{}::{}", namespace, event_type, ts, summary);
    truncate_chars(&key, MAX_GRAPH_KEY_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
