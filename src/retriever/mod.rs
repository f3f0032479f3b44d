//! Hybrid context retrieval
//!
//! Merges dense-vector ANN hits with graph relation expansion, applies
//! temporal decay and importance/frequency boosts, resolves memory-slot
//! conflicts, drops expired entries, and renders the context text. Both
//! store legs are best-effort: an adapter failure degrades the result
//! instead of failing the request.

mod cache;

pub use cache::RetrieveCache;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::adapters::{Embedder, GraphStore, VectorStore};
use crate::types::{
    MemoryKind, RelatedQuery, RetrieveResponse, RetrievedMemory, VectorSearchRequest,
};

/// Source tags attached to merged records
const SOURCE_VECTOR: &str = "qdrant";
const SOURCE_GRAPH: &str = "neo4j";

/// Retrieval scoring knobs
#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    /// ANN hits below this similarity are discarded (`MIN_SEMANTIC_SCORE`)
    pub min_semantic_score: f32,
    pub semantic_weight: f32,
    pub relation_weight: f32,
    pub half_life_days: f64,
    pub importance_boost: f32,
    pub frequency_boost: f32,
    /// Fallback `max_memories` when the request omits it
    pub default_max_memories: usize,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            min_semantic_score: 0.3,
            semantic_weight: 0.6,
            relation_weight: 0.4,
            half_life_days: 90.0,
            importance_boost: 0.3,
            frequency_boost: 0.2,
            default_max_memories: 5,
            cache_ttl_secs: 0,
            cache_max_entries: 512,
        }
    }
}

/// Retriever input after ingress normalization
#[derive(Debug, Clone)]
pub struct RetrieveInput {
    pub namespace: String,
    pub user_input: String,
    pub session_id: String,
    pub max_memories: usize,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Candidate {
    id: String,
    content: String,
    importance: f32,
    frequency: u32,
    last_seen_at: Option<String>,
    kind: Option<MemoryKind>,
    memory_key: Option<String>,
    subject: Option<String>,
    expires_at: Option<String>,
    semantic: f32,
    relation: f32,
    sources: Vec<String>,
    relevance: f32,
    final_score: f32,
}

impl Candidate {
    fn tag_source(&mut self, source: &str) {
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
    }
}

pub struct Retriever {
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    config: RetrieveConfig,
    cache: RetrieveCache,
}

impl Retriever {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        config: RetrieveConfig,
    ) -> Self {
        let cache = RetrieveCache::new(config.cache_ttl_secs, config.cache_max_entries);
        Self {
            vector,
            graph,
            embedder,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &RetrieveConfig {
        &self.config
    }

    /// Run the hybrid retrieval pipeline. Never fails: store errors degrade
    /// to a thinner candidate set.
    pub async fn retrieve(&self, input: RetrieveInput) -> RetrieveResponse {
        let max_memories = input.max_memories.max(1);
        let cache_key = RetrieveCache::cache_key(
            &input.namespace,
            &input.session_id,
            max_memories,
            &input.user_input,
        );
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached;
        }

        // Candidate budget: over-fetch so decay and slot resolution have
        // something to work with, bounded to keep store load flat.
        let budget = (max_memories * 5).clamp(10, 50);
        let mut merged: HashMap<String, Candidate> = HashMap::new();

        self.merge_vector_hits(&input, budget, &mut merged).await;
        self.merge_graph_records(&input, budget, &mut merged).await;

        let now = Utc::now();
        let mut candidates: Vec<Candidate> = merged
            .into_values()
            .filter(|c| !is_expired(c.expires_at.as_deref(), &now))
            .collect();

        let (sw, rw) = normalized_weights(self.config.semantic_weight, self.config.relation_weight);
        for candidate in &mut candidates {
            candidate.relevance = sw * candidate.semantic + rw * candidate.relation;
            let freq_norm = ((1.0 + candidate.frequency as f64).ln() / 10f64.ln()).clamp(0.0, 1.0);
            let boost = (1.0 + self.config.importance_boost as f64
                * candidate.importance.clamp(0.0, 1.0) as f64)
                * (1.0 + self.config.frequency_boost as f64 * freq_norm);
            let decay = self.decay_factor(candidate.last_seen_at.as_deref(), &now);
            candidate.final_score = (candidate.relevance as f64 * boost * decay) as f32;
        }

        candidates.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let resolved = resolve_slots(candidates);
        let memories: Vec<RetrievedMemory> = resolved
            .into_iter()
            .take(max_memories)
            .map(|c| RetrievedMemory {
                id: c.id,
                content: c.content,
                importance: c.importance,
                relevance: c.relevance,
                semantic_score: c.semantic,
                relation_score: c.relation,
                kind: c.kind,
                memory_key: c.memory_key,
                subject: c.subject,
                sources: c.sources,
            })
            .collect();

        let context = render_context(&memories);
        let response = RetrieveResponse {
            entities: input.entities,
            topics: input.topics,
            memories,
            context,
        };
        self.cache.put(cache_key, response.clone());
        response
    }

    async fn merge_vector_hits(
        &self,
        input: &RetrieveInput,
        budget: usize,
        merged: &mut HashMap<String, Candidate>,
    ) {
        let vector = match self.embedder.embed(&input.user_input).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("embed failed, skipping semantic leg: {}", e);
                return;
            }
        };
        let hits = match self
            .vector
            .search(VectorSearchRequest {
                vector,
                limit: budget,
                score_threshold: self.config.min_semantic_score,
                namespace: input.namespace.clone(),
            })
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::debug!("vector search failed, skipping semantic leg: {}", e);
                return;
            }
        };
        for hit in hits {
            let candidate = merged.entry(hit.id.clone()).or_default();
            if candidate.id.is_empty() {
                candidate.id = hit.id.clone();
            }
            if let Some(payload) = hit.payload {
                candidate.content = payload.content.clone();
                candidate.importance = candidate.importance.max(payload.importance);
                candidate.frequency = candidate.frequency.max(payload.frequency.unwrap_or(0));
                candidate.last_seen_at = payload.last_seen_at().map(String::from);
                candidate.kind = candidate.kind.or(payload.kind);
                candidate.memory_key = candidate.memory_key.take().or(payload.memory_key);
                candidate.subject = candidate.subject.take().or(payload.subject);
                candidate.expires_at = candidate.expires_at.take().or(payload.expires_at);
            }
            candidate.semantic = candidate.semantic.max(hit.score);
            candidate.tag_source(SOURCE_VECTOR);
        }
    }

    async fn merge_graph_records(
        &self,
        input: &RetrieveInput,
        budget: usize,
        merged: &mut HashMap<String, Candidate>,
    ) {
        let records = match self
            .graph
            .query_related(RelatedQuery {
                namespace: input.namespace.clone(),
                entities: input.entities.clone(),
                topics: input.topics.clone(),
                limit: budget,
            })
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::debug!("graph relation query failed, skipping: {}", e);
                return;
            }
        };
        for record in records {
            let candidate = merged.entry(record.id.clone()).or_default();
            if candidate.id.is_empty() {
                candidate.id = record.id.clone();
                candidate.content = record.content.clone();
            }
            candidate.importance = candidate.importance.max(record.importance);
            candidate.frequency = candidate.frequency.max(record.frequency);
            if candidate.last_seen_at.is_none() {
                candidate.last_seen_at = record.last_seen_at.clone();
            }
            candidate.kind = candidate.kind.or(record.kind);
            candidate.memory_key = candidate.memory_key.take().or(record.memory_key);
            candidate.subject = candidate.subject.take().or(record.subject);
            candidate.expires_at = candidate.expires_at.take().or(record.expires_at);
            candidate.relation = candidate.relation.max(record.relation_score);
            candidate.tag_source(SOURCE_GRAPH);
        }
    }

    /// Halflife decay on the fused relevance, floored so very old memories
    /// remain reachable
    fn decay_factor(&self, last_seen_at: Option<&str>, now: &DateTime<Utc>) -> f64 {
        let Some(raw) = last_seen_at else {
            return 1.0;
        };
        let Ok(parsed) = DateTime::parse_from_rfc3339(raw) else {
            return 1.0;
        };
        let age_ms = (*now - parsed.with_timezone(&Utc)).num_milliseconds().max(0);
        let age_days = age_ms as f64 / 86_400_000.0;
        let decay = 0.5f64.powf(age_days / self.config.half_life_days.max(f64::MIN_POSITIVE));
        decay.max(0.1)
    }
}

fn normalized_weights(semantic: f32, relation: f32) -> (f32, f32) {
    let total = semantic + relation;
    if total <= 0.0 {
        (0.6, 0.4)
    } else {
        (semantic / total, relation / total)
    }
}

fn is_expired(expires_at: Option<&str>, now: &DateTime<Utc>) -> bool {
    match expires_at.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
        Some(ts) => ts.with_timezone(&Utc) < *now,
        None => false,
    }
}

/// Keep one record per memory slot. Records sharing a `memory_key` compete;
/// the highest final score wins, ties broken by importance.
fn resolve_slots(sorted: Vec<Candidate>) -> Vec<Candidate> {
    let mut best_by_slot: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in sorted {
        let slot = candidate
            .memory_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| candidate.id.clone());
        match best_by_slot.get(&slot) {
            Some(&idx) => {
                let held = &kept[idx];
                let wins = candidate.final_score > held.final_score
                    || (candidate.final_score == held.final_score
                        && candidate.importance > held.importance);
                if wins {
                    kept[idx] = candidate;
                }
            }
            None => {
                best_by_slot.insert(slot, kept.len());
                kept.push(candidate);
            }
        }
    }
    kept
}

fn render_context(memories: &[RetrievedMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("Relevant long-term memory:");
    for (i, memory) in memories.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. ({:.2}, imp={:.2}) {}",
            i + 1,
            memory.relevance,
            memory.importance,
            memory.content
        ));
    }
    out
}
