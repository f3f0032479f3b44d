//! Transcript ingestion pipeline
//!
//! Turns a session transcript into durable memories: analyze into drafts,
//! filter sensitive content, embed, probe for novelty, gate on importance,
//! dedupe against the vector store, then write the dual vector + graph
//! representation. Idempotent per transcript hash.
//!
//! Individual store failures are best-effort: a write error never aborts
//! the draft loop, so a partial outage still stores as much as possible.

mod sensitive;

pub use sensitive::{SensitiveConfig, SensitiveFilter, DEFAULT_RULESET_VERSION};

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::adapters::{Embedder, GraphStore, TranscriptAnalyzer, VectorPoint, VectorStore};
use crate::encoding::{stable_hash_hex16, transcript_hash};
use crate::error::Result;
use crate::importance::{self, ImportanceSignals};
use crate::types::{
    entity_node_id, event_node_id, qualify_id, session_node_id, topic_node_id, AnalyzeRequest,
    Analysis, ChatMessage, Draft, MemoryPayload, SessionIngestMeta, UpdateResponse, UpdateStatus,
    VectorSearchRequest, MAX_TAG_ITEMS,
};

/// Ingestion tuning knobs
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Drafts scoring below this importance are dropped
    pub importance_threshold: f32,
    pub max_memories_per_update: usize,
    /// Similarity at or above which a draft reuses the neighbor's id
    pub dedupe_score: f32,
    /// Synapse fan-out; 0 disables `RELATED_TO` linking
    pub related_top_k: usize,
    /// Floor for the synapse similarity threshold
    pub min_semantic_score: f32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            importance_threshold: 0.3,
            max_memories_per_update: 10,
            dedupe_score: 0.92,
            related_top_k: 3,
            min_semantic_score: 0.3,
        }
    }
}

pub struct Updater {
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    analyzer: Arc<dyn TranscriptAnalyzer>,
    sensitive: SensitiveFilter,
    config: UpdateConfig,
}

impl Updater {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        analyzer: Arc<dyn TranscriptAnalyzer>,
        sensitive: SensitiveFilter,
        config: UpdateConfig,
    ) -> Self {
        Self {
            vector,
            graph,
            embedder,
            analyzer,
            sensitive,
            config,
        }
    }

    /// Ingest one transcript for `(namespace, session_id)`.
    ///
    /// Returns `skipped` when the transcript hash matches the session's
    /// last ingest (replay). Analyzer failures propagate so the queue can
    /// retry with backoff.
    pub async fn update(
        &self,
        namespace: &str,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<UpdateResponse> {
        let hash = transcript_hash(messages)?;
        let message_count = messages.len();

        if let Err(e) = self.graph.upsert_session(namespace, session_id).await {
            tracing::debug!("session upsert failed (continuing): {}", e);
        }
        match self.graph.session_ingest_meta(namespace, session_id).await {
            Ok(Some(meta)) if meta.last_transcript_hash.as_deref() == Some(hash.as_str()) => {
                return Ok(UpdateResponse {
                    status: UpdateStatus::Skipped,
                    memories_added: 0,
                    memories_filtered: 0,
                    error: None,
                    degraded: None,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("ingest marker read failed (continuing): {}", e),
        }

        let analysis = self
            .analyzer
            .analyze(AnalyzeRequest {
                session_id: session_id.to_string(),
                messages: messages.to_vec(),
                max_memories: self.config.max_memories_per_update,
                importance_threshold: self.config.importance_threshold,
            })
            .await?;

        self.link_analysis(namespace, session_id, &analysis).await;

        let mut added = 0usize;
        let mut filtered = analysis.filtered;
        for draft in &analysis.drafts {
            if self.sensitive.is_sensitive(&draft.content) {
                filtered += 1;
                continue;
            }
            match self
                .ingest_draft(namespace, session_id, draft, &analysis, &hash, message_count)
                .await
            {
                DraftOutcome::Added => added += 1,
                DraftOutcome::Filtered => filtered += 1,
                DraftOutcome::Skipped => {}
            }
        }

        let meta = SessionIngestMeta {
            last_transcript_hash: Some(hash),
            last_message_count: Some(message_count),
            last_ingested_at: Some(Utc::now().to_rfc3339()),
        };
        if let Err(e) = self
            .graph
            .set_session_ingest_meta(namespace, session_id, &meta)
            .await
        {
            tracing::debug!("ingest marker write failed (continuing): {}", e);
        }

        Ok(UpdateResponse {
            status: UpdateStatus::Processed,
            memories_added: added,
            memories_filtered: filtered,
            error: None,
            degraded: None,
        })
    }

    /// Upsert topic/entity/event nodes and their links, all best-effort
    async fn link_analysis(&self, namespace: &str, session_id: &str, analysis: &Analysis) {
        let session_key = session_node_id(namespace, session_id);

        for topic in &analysis.topics {
            let topic_key = topic_node_id(namespace, topic);
            guarded(
                self.graph
                    .upsert_node(&topic_key, "Topic", json!({ "name": topic }))
                    .await,
                "topic upsert",
            );
            guarded(
                self.graph
                    .upsert_edge(&session_key, &topic_key, "HAS_TOPIC", json!({}))
                    .await,
                "session-topic link",
            );
        }

        for entity in &analysis.entities {
            let entity_key = entity_node_id(namespace, &entity.entity_type, &entity.name);
            guarded(
                self.graph
                    .upsert_node(
                        &entity_key,
                        "Entity",
                        json!({ "name": entity.name, "type": entity.entity_type }),
                    )
                    .await,
                "entity upsert",
            );
            for topic in &analysis.topics {
                let topic_key = topic_node_id(namespace, topic);
                guarded(
                    self.graph
                        .upsert_edge(&topic_key, &entity_key, "MENTIONS", json!({}))
                        .await,
                    "topic-entity link",
                );
            }
        }

        for event in &analysis.events {
            let event_key = event_node_id(namespace, &event.event_type, &event.ts, &event.summary);
            guarded(
                self.graph
                    .upsert_node(
                        &event_key,
                        "Event",
                        json!({
                            "type": event.event_type,
                            "ts": event.ts,
                            "summary": event.summary,
                        }),
                    )
                    .await,
                "event upsert",
            );
            guarded(
                self.graph
                    .upsert_edge(&session_key, &event_key, "HAS_EVENT", json!({}))
                    .await,
                "session-event link",
            );
            for topic in &event.topics {
                let topic_key = topic_node_id(namespace, topic);
                guarded(
                    self.graph
                        .upsert_edge(&event_key, &topic_key, "ABOUT_TOPIC", json!({}))
                        .await,
                    "event-topic link",
                );
            }
            for entity in &event.entities {
                let entity_key =
                    entity_node_id(namespace, analysis.entity_type_of(entity), entity);
                guarded(
                    self.graph
                        .upsert_edge(&event_key, &entity_key, "INVOLVES", json!({}))
                        .await,
                    "event-entity link",
                );
            }
        }
    }

    async fn ingest_draft(
        &self,
        namespace: &str,
        session_id: &str,
        draft: &Draft,
        analysis: &Analysis,
        hash: &str,
        message_count: usize,
    ) -> DraftOutcome {
        let vector = match self.embedder.embed(&draft.content).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("embed failed, draft skipped: {}", e);
                return DraftOutcome::Skipped;
            }
        };

        // Novelty probe: the nearest stored neighbor sets both the novelty
        // signal and the dedupe candidate.
        let best = match self
            .vector
            .search(VectorSearchRequest {
                vector: vector.clone(),
                limit: 1,
                score_threshold: 0.0,
                namespace: namespace.to_string(),
            })
            .await
        {
            Ok(hits) => hits.into_iter().next(),
            Err(e) => {
                tracing::debug!("novelty probe failed, assuming novel: {}", e);
                None
            }
        };
        let best_score = best.as_ref().map(|h| h.score).unwrap_or(0.0);
        let best_id = best.as_ref().map(|h| h.id.clone());
        let novelty = (1.0 - best_score).clamp(0.0, 1.0);

        let importance = importance::score(&ImportanceSignals {
            frequency: draft.signals.frequency,
            novelty,
            user_intent: draft.signals.user_intent,
            length: draft.signals.length,
        });
        if importance < self.config.importance_threshold {
            return DraftOutcome::Filtered;
        }

        let (is_dup, raw_id) = match best_id {
            Some(neighbor_id) if best_score >= self.config.dedupe_score => (true, neighbor_id),
            _ => (
                false,
                format!(
                    "mem_{}",
                    stable_hash_hex16(&format!("{}:{}", session_id, draft.content))
                ),
            ),
        };
        let id = qualify_id(namespace, &raw_id);

        let existing = if is_dup {
            match self.vector.fetch(&id).await {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::debug!("existing payload fetch failed, merging blind: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let payload = build_payload(
            namespace,
            session_id,
            &id,
            draft,
            importance,
            existing,
            hash,
            message_count,
        );

        guarded(self.graph.upsert_memory(&payload).await, "memory node upsert");
        for topic in &payload.topics {
            let topic_key = topic_node_id(namespace, topic);
            guarded(
                self.graph
                    .upsert_edge(&id, &topic_key, "HAS_TOPIC", json!({}))
                    .await,
                "memory-topic link",
            );
        }
        for entity in &payload.entities {
            let entity_key = entity_node_id(namespace, analysis.entity_type_of(entity), entity);
            guarded(
                self.graph
                    .upsert_edge(&id, &entity_key, "MENTIONS", json!({}))
                    .await,
                "memory-entity link",
            );
        }

        guarded(
            self.vector
                .upsert(VectorPoint {
                    vector: vector.clone(),
                    payload,
                })
                .await,
            "vector upsert",
        );

        if self.config.related_top_k > 0 {
            self.link_synapses(namespace, &id, &vector).await;
        }

        DraftOutcome::Added
    }

    /// Directed `RELATED_TO` edges to the closest stored neighbors
    async fn link_synapses(&self, namespace: &str, id: &str, vector: &[f32]) {
        let threshold = self.config.min_semantic_score.max(0.8);
        let hits = match self
            .vector
            .search(VectorSearchRequest {
                vector: vector.to_vec(),
                limit: self.config.related_top_k + 1,
                score_threshold: threshold,
                namespace: namespace.to_string(),
            })
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::debug!("synapse probe failed: {}", e);
                return;
            }
        };
        for hit in hits.into_iter().filter(|h| h.id != id) {
            guarded(
                self.graph.link_memories(id, &hit.id, hit.score).await,
                "synapse link",
            );
        }
    }
}

enum DraftOutcome {
    Added,
    Filtered,
    Skipped,
}

fn guarded(result: Result<()>, what: &str) {
    if let Err(e) = result {
        tracing::debug!("{} failed (continuing): {}", what, e);
    }
}

/// Union with cap, preserving order and uniqueness
fn union_capped(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = existing.to_vec();
    for item in incoming {
        if !out.contains(item) {
            out.push(item.clone());
        }
        if out.len() >= MAX_TAG_ITEMS {
            break;
        }
    }
    out.truncate(MAX_TAG_ITEMS);
    out
}

#[allow(clippy::too_many_arguments)]
fn build_payload(
    namespace: &str,
    session_id: &str,
    id: &str,
    draft: &Draft,
    importance: f32,
    existing: Option<MemoryPayload>,
    hash: &str,
    message_count: usize,
) -> MemoryPayload {
    let now = Utc::now().to_rfc3339();
    match existing {
        Some(existing) => MemoryPayload {
            id: id.to_string(),
            namespace: namespace.to_string(),
            kind: draft.kind.or(existing.kind),
            memory_key: draft.memory_key.clone().or(existing.memory_key),
            subject: draft.subject.clone().or(existing.subject),
            expires_at: draft.expires_at.clone().or(existing.expires_at),
            confidence: draft.confidence.or(existing.confidence),
            content: existing.content,
            session_id: session_id.to_string(),
            source_transcript_hash: Some(hash.to_string()),
            source_message_count: Some(message_count),
            created_at: existing.created_at,
            updated_at: Some(now),
            importance: existing.importance.max(importance),
            frequency: Some(existing.frequency.unwrap_or(0) + 1),
            entities: union_capped(&existing.entities, &draft.entities),
            topics: union_capped(&existing.topics, &draft.topics),
        },
        None => MemoryPayload {
            id: id.to_string(),
            namespace: namespace.to_string(),
            kind: draft.kind,
            memory_key: draft.memory_key.clone(),
            subject: draft.subject.clone(),
            expires_at: draft.expires_at.clone(),
            confidence: draft.confidence,
            content: draft.content.clone(),
            session_id: session_id.to_string(),
            source_transcript_hash: Some(hash.to_string()),
            source_message_count: Some(message_count),
            created_at: draft.created_at.clone(),
            updated_at: Some(now),
            importance,
            frequency: Some(1),
            entities: union_capped(&[], &draft.entities),
            topics: union_capped(&[], &draft.topics),
        },
    }
}
