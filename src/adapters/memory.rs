//! In-memory adapters
//!
//! Process-local implementations of the four adapter contracts. They back the
//! test suite and the dependency-free dev mode of the server binary: cosine
//! ANN over stored vectors, an adjacency-map graph, a hashing-trick embedder,
//! and a keyword-heuristic transcript analyzer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::json;

use super::{
    cosine_similarity, Embedder, GraphStore, TranscriptAnalyzer, VectorPoint, VectorStore,
};
use crate::error::Result;
use crate::types::{
    session_node_id, AnalyzeRequest, Analysis, ChatMessage, Draft, DraftSignals, EntityRef,
    MemoryKind, MemoryPayload, RelatedQuery, RelatedRecord, ScoredPoint, SessionIngestMeta,
    VectorSearchRequest, MAX_TAG_ITEMS,
};

// ============================================================================
// Vector store
// ============================================================================

/// Cosine ANN over vectors held in process memory
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<HashMap<String, (Vec<f32>, MemoryPayload)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, point: VectorPoint) -> Result<()> {
        self.points
            .write()
            .insert(point.payload.id.clone(), (point.vector, point.payload));
        Ok(())
    }

    async fn search(&self, req: VectorSearchRequest) -> Result<Vec<ScoredPoint>> {
        let points = self.points.read();
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter(|(_, payload)| payload.namespace == req.namespace)
            .map(|(vector, payload)| ScoredPoint {
                id: payload.id.clone(),
                score: cosine_similarity(&req.vector, vector),
                payload: Some(payload.clone()),
            })
            .filter(|hit| hit.score >= req.score_threshold)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(req.limit);
        Ok(hits)
    }

    async fn fetch(&self, id: &str) -> Result<Option<MemoryPayload>> {
        Ok(self.points.read().get(id).map(|(_, p)| p.clone()))
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut points = self.points.write();
        let before = points.len();
        for id in ids {
            points.remove(id);
        }
        Ok(before - points.len())
    }

    async fn delete_by_session(&self, namespace: &str, session_id: &str) -> Result<usize> {
        let mut points = self.points.write();
        let before = points.len();
        points.retain(|_, (_, p)| !(p.namespace == namespace && p.session_id == session_id));
        Ok(before - points.len())
    }

    async fn schema_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Graph store
// ============================================================================

#[derive(Default)]
struct GraphState {
    /// key -> (label, props)
    nodes: HashMap<String, (String, serde_json::Value)>,
    /// (from, rel, to) -> props
    edges: HashMap<(String, String, String), serde_json::Value>,
    /// memory id -> payload fields mirrored from the vector side
    memories: HashMap<String, MemoryPayload>,
    /// session node key -> ingest markers
    session_meta: HashMap<String, SessionIngestMeta>,
}

/// Adjacency-map knowledge graph held in process memory
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    /// Edge props for assertions in tests
    pub fn edge_props(&self, from: &str, rel: &str, to: &str) -> Option<serde_json::Value> {
        self.state
            .read()
            .edges
            .get(&(from.to_string(), rel.to_string(), to.to_string()))
            .cloned()
    }

    fn related_raw_score(memory: &MemoryPayload, query: &RelatedQuery) -> f32 {
        let topic_hits = memory
            .topics
            .iter()
            .filter(|t| query.topics.iter().any(|q| q.eq_ignore_ascii_case(t)))
            .count();
        let entity_hits = memory
            .entities
            .iter()
            .filter(|e| query.entities.iter().any(|q| q.eq_ignore_ascii_case(e)))
            .count();
        (topic_hits + entity_hits) as f32
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_session(&self, namespace: &str, session_id: &str) -> Result<()> {
        let key = session_node_id(namespace, session_id);
        let mut state = self.state.write();
        state.nodes.entry(key).or_insert_with(|| {
            (
                "Session".to_string(),
                json!({ "namespace": namespace, "session_id": session_id }),
            )
        });
        Ok(())
    }

    async fn session_ingest_meta(
        &self,
        namespace: &str,
        session_id: &str,
    ) -> Result<Option<SessionIngestMeta>> {
        let key = session_node_id(namespace, session_id);
        Ok(self.state.read().session_meta.get(&key).cloned())
    }

    async fn set_session_ingest_meta(
        &self,
        namespace: &str,
        session_id: &str,
        meta: &SessionIngestMeta,
    ) -> Result<()> {
        let key = session_node_id(namespace, session_id);
        self.state.write().session_meta.insert(key, meta.clone());
        Ok(())
    }

    async fn upsert_node(&self, key: &str, label: &str, props: serde_json::Value) -> Result<()> {
        self.state
            .write()
            .nodes
            .insert(key.to_string(), (label.to_string(), props));
        Ok(())
    }

    async fn upsert_edge(
        &self,
        from: &str,
        to: &str,
        rel: &str,
        props: serde_json::Value,
    ) -> Result<()> {
        self.state
            .write()
            .edges
            .insert((from.to_string(), rel.to_string(), to.to_string()), props);
        Ok(())
    }

    async fn upsert_memory(&self, payload: &MemoryPayload) -> Result<()> {
        let mut state = self.state.write();
        state.nodes.insert(
            payload.id.clone(),
            ("Memory".to_string(), json!({ "namespace": payload.namespace })),
        );
        state.memories.insert(payload.id.clone(), payload.clone());
        Ok(())
    }

    async fn link_memories(&self, from: &str, to: &str, score: f32) -> Result<()> {
        let key = (from.to_string(), "RELATED_TO".to_string(), to.to_string());
        let mut state = self.state.write();
        let merged = match state.edges.get(&key).and_then(|p| p["score"].as_f64()) {
            Some(existing) => (existing as f32).max(score),
            None => score,
        };
        state.edges.insert(
            key,
            json!({ "score": merged, "updated_at": Utc::now().to_rfc3339() }),
        );
        Ok(())
    }

    async fn query_related(&self, query: RelatedQuery) -> Result<Vec<RelatedRecord>> {
        let state = self.state.read();
        let mut records: Vec<RelatedRecord> = state
            .memories
            .values()
            .filter(|m| m.namespace == query.namespace)
            .filter_map(|m| {
                let raw = Self::related_raw_score(m, &query);
                if raw <= 0.0 {
                    return None;
                }
                Some(RelatedRecord {
                    id: m.id.clone(),
                    content: m.content.clone(),
                    importance: m.importance,
                    frequency: m.frequency.unwrap_or(0),
                    last_seen_at: m.last_seen_at().map(String::from),
                    // Raw overlap normalized the way the production graph
                    // query does: least(1.0, raw / 2.0).
                    relation_score: (raw / 2.0).min(1.0),
                    kind: m.kind,
                    memory_key: m.memory_key.clone(),
                    subject: m.subject.clone(),
                    expires_at: m.expires_at.clone(),
                    confidence: m.confidence,
                })
            })
            .collect();
        records.sort_by(|a, b| {
            b.relation_score
                .partial_cmp(&a.relation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records.truncate(query.limit);
        Ok(records)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.write();
        let mut removed = 0;
        for id in ids {
            if state.memories.remove(id).is_some() {
                removed += 1;
            }
            state.nodes.remove(id);
            state
                .edges
                .retain(|(from, _, to), _| from != id && to != id);
        }
        Ok(removed)
    }

    async fn delete_by_session(&self, namespace: &str, session_id: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let state = self.state.read();
            state
                .memories
                .values()
                .filter(|m| m.namespace == namespace && m.session_id == session_id)
                .map(|m| m.id.clone())
                .collect()
        };
        self.delete_by_ids(&ids).await
    }

    async fn schema_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Hashing-trick embedder
///
/// Deterministic, fast, no model download. Tokens and bigrams are hashed
/// into a fixed number of dimensions with a sign trick, then L2-normalized.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() > 1)
            .map(String::from)
            .collect()
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = crate::encoding::sha256_hex(token.as_bytes());
        let head = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
        (head as usize) % self.dimensions
    }

    fn sign(token: &str) -> f32 {
        let digest = crate::encoding::sha256_hex(token.as_bytes());
        if digest.as_bytes()[63] % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = Self::tokenize(text);
        let mut embedding = vec![0.0_f32; self.dimensions];
        if tokens.is_empty() {
            return Ok(embedding);
        }

        let doc_len = tokens.len() as f32;
        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token).or_insert(0.0) += 1.0;
        }
        for (token, count) in tf {
            let weight = (1.0 + count / doc_len).ln() * (1.0 + token.len() as f32 * 0.1);
            embedding[self.bucket(token)] += weight * Self::sign(token);
        }

        // Bigrams capture a little word order, weighted below unigrams.
        for window in tokens.windows(2) {
            let bigram = format!("{}_{}", window[0], window[1]);
            embedding[self.bucket(&bigram)] += 0.5 * Self::sign(&bigram);
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// Analyzer
// ============================================================================

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "their", "there", "these", "thing", "think", "those", "would",
    "could", "should", "where", "which", "while", "because", "being", "every", "still",
];

const INTENT_MARKERS: &[&str] = &[
    "remember",
    "don't forget",
    "always",
    "never",
    "prefer",
    "i like",
    "i love",
    "i hate",
    "call me",
    "my name",
];

/// Keyword-heuristic transcript analyzer
///
/// One draft per substantive user message, with naive topic/entity
/// extraction. Event detection is left to richer analyzers.
#[derive(Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn topics_of(messages: &[ChatMessage]) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for msg in messages {
            for word in msg.content.to_lowercase().split(|c: char| !c.is_alphabetic()) {
                if word.len() > 4 && !STOPWORDS.contains(&word) {
                    *counts.entry(word.to_string()).or_insert(0) += 1;
                }
            }
        }
        let mut topics: Vec<(String, usize)> = counts.into_iter().collect();
        topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        topics.truncate(MAX_TAG_ITEMS);
        topics.into_iter().map(|(t, _)| t).collect()
    }

    fn entities_of(messages: &[ChatMessage]) -> Vec<EntityRef> {
        let mut seen: Vec<String> = Vec::new();
        for msg in messages {
            for (i, word) in msg.content.split_whitespace().enumerate() {
                let trimmed: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
                // Sentence-initial capitals are usually not names.
                if i == 0 || trimmed.len() < 3 {
                    continue;
                }
                let mut chars = trimmed.chars();
                let capitalized = chars.next().is_some_and(|c| c.is_uppercase());
                if capitalized && !seen.contains(&trimmed) {
                    seen.push(trimmed);
                    if seen.len() >= MAX_TAG_ITEMS {
                        return Self::to_entity_refs(seen);
                    }
                }
            }
        }
        Self::to_entity_refs(seen)
    }

    fn to_entity_refs(names: Vec<String>) -> Vec<EntityRef> {
        names
            .into_iter()
            .map(|name| EntityRef {
                name,
                entity_type: "other".to_string(),
            })
            .collect()
    }

    fn user_intent_of(content_lower: &str) -> f32 {
        if INTENT_MARKERS.iter().any(|m| content_lower.contains(m)) {
            0.9
        } else if content_lower.starts_with("i ") || content_lower.contains(" i ") {
            0.4
        } else {
            0.2
        }
    }

    fn kind_of(content_lower: &str) -> MemoryKind {
        if content_lower.contains("prefer")
            || content_lower.contains("i like")
            || content_lower.contains("i love")
            || content_lower.contains("i hate")
        {
            MemoryKind::Preference
        } else if content_lower.contains("always") || content_lower.contains("never") {
            MemoryKind::Rule
        } else if content_lower.contains("need to")
            || content_lower.contains("remind me")
            || content_lower.contains("todo")
        {
            MemoryKind::Task
        } else if content_lower.contains("today") || content_lower.contains("tomorrow") {
            MemoryKind::Ephemeral
        } else {
            MemoryKind::Fact
        }
    }
}

#[async_trait]
impl TranscriptAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, req: AnalyzeRequest) -> Result<Analysis> {
        let now = Utc::now();
        let topics = Self::topics_of(&req.messages);
        let entities = Self::entities_of(&req.messages);

        let user_contents: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.trim())
            .collect();

        let mut drafts = Vec::new();
        let mut filtered = 0usize;
        for content in &user_contents {
            if drafts.len() >= req.max_memories {
                break;
            }
            if content.len() < 8 {
                filtered += 1;
                continue;
            }
            let lower = content.to_lowercase();
            let kind = Self::kind_of(&lower);
            let subject = entities
                .first()
                .map(|e| e.name.to_lowercase())
                .or_else(|| topics.first().cloned());
            let memory_key = match (kind, &subject) {
                (MemoryKind::Preference | MemoryKind::Rule, Some(subject)) => {
                    Some(format!("{}:{}", kind.as_str(), subject))
                }
                _ => None,
            };
            let expires_at = (kind == MemoryKind::Ephemeral)
                .then(|| (now + Duration::hours(24)).to_rfc3339());
            let frequency = user_contents.iter().filter(|c| *c == content).count() as f32;

            drafts.push(Draft {
                content: content.to_string(),
                kind: Some(kind),
                memory_key,
                subject,
                expires_at,
                confidence: None,
                entities: entities.iter().map(|e| e.name.clone()).collect(),
                topics: topics.clone(),
                created_at: now.to_rfc3339(),
                signals: DraftSignals {
                    frequency,
                    user_intent: Self::user_intent_of(&lower),
                    length: content.len(),
                },
            });
        }

        Ok(Analysis {
            topics,
            entities,
            events: Vec::new(),
            drafts,
            filtered,
        })
    }
}
