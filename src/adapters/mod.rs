//! Adapter contracts for external collaborators
//!
//! The vector store, graph store, embedder, and transcript analyzer are
//! pluggable. The core treats every call as independent and concurrency-safe;
//! callers decide per call whether a failure aborts or degrades (best-effort).
//!
//! In-memory implementations live in [`memory`]; they back the test suite and
//! the dependency-free dev mode of the server binary.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    AnalyzeRequest, Analysis, MemoryPayload, RelatedQuery, RelatedRecord, ScoredPoint,
    SessionIngestMeta, VectorSearchRequest,
};

/// A point written to the vector store; the id lives inside the payload
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub vector: Vec<f32>,
    pub payload: MemoryPayload,
}

/// Dense-vector ANN store (e.g. Qdrant)
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or fully replace the point with the payload's id
    async fn upsert(&self, point: VectorPoint) -> Result<()>;

    /// ANN search with namespace filter and score threshold
    async fn search(&self, req: VectorSearchRequest) -> Result<Vec<ScoredPoint>>;

    /// Fetch a payload by qualified id
    async fn fetch(&self, id: &str) -> Result<Option<MemoryPayload>>;

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

    async fn delete_by_session(&self, namespace: &str, session_id: &str) -> Result<usize>;

    /// Whether collections/indexes exist and match the expected shape
    async fn schema_ready(&self) -> Result<bool>;

    /// Cheap liveness probe for readiness checks
    async fn ping(&self) -> Result<()>;
}

/// Knowledge-graph store (e.g. Neo4j)
///
/// Edges are directed; node and edge upserts must be idempotent under
/// repeated ingestion of the same transcript.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the session node if absent
    async fn upsert_session(&self, namespace: &str, session_id: &str) -> Result<()>;

    /// Read the session's ingest markers
    async fn session_ingest_meta(
        &self,
        namespace: &str,
        session_id: &str,
    ) -> Result<Option<SessionIngestMeta>>;

    /// Advance the session's ingest markers
    async fn set_session_ingest_meta(
        &self,
        namespace: &str,
        session_id: &str,
        meta: &SessionIngestMeta,
    ) -> Result<()>;

    /// Upsert a labelled node by key
    async fn upsert_node(&self, key: &str, label: &str, props: serde_json::Value) -> Result<()>;

    /// Upsert a directed edge; replaces props on re-upsert
    async fn upsert_edge(
        &self,
        from: &str,
        to: &str,
        rel: &str,
        props: serde_json::Value,
    ) -> Result<()>;

    /// Upsert a memory node carrying the shared payload fields
    async fn upsert_memory(&self, payload: &MemoryPayload) -> Result<()>;

    /// Upsert a directed `RELATED_TO` edge between two memories.
    /// The stored score merges by max and the edge stamps `updated_at`.
    async fn link_memories(&self, from: &str, to: &str, score: f32) -> Result<()>;

    /// Relation expansion: memories connected to the given entities/topics
    async fn query_related(&self, query: RelatedQuery) -> Result<Vec<RelatedRecord>>;

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

    async fn delete_by_session(&self, namespace: &str, session_id: &str) -> Result<usize>;

    async fn schema_ready(&self) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Opaque text embedder: `embed(text) -> vector[d]`
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Opaque transcript analyzer: messages in, drafts/topics/entities/events out
#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync {
    async fn analyze(&self, req: AnalyzeRequest) -> Result<Analysis>;
}

/// Cosine similarity between two vectors of equal dimension
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
