//! Orchestration of the memory engine: ingest throttling, value
//! assessment, extraction, fusion, persistence, and query-planned
//! retrieval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_config::MemoryConfig;
use murmur_llm::{EmbeddingProvider, GenerateOptions, LlmProvider, RequestKind, json as llm_json};

use crate::chunk::{GLOBAL_SCOPE, MemoryChunk};
use crate::error::MemoryError;
use crate::extractor::{ConversationContext, MemoryExtractor};
use crate::fusion::{MemoryFusion, content_fingerprint};
use crate::retrieval::{MemoryRetriever, QueryPlan};
use crate::store::{MemoryStore, MetadataFilter, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySystemStatus {
    Initializing,
    Ready,
    Building,
    Retrieving,
    Error,
}

/// One conversation window handed to [`MemorySystem::ingest_conversation`].
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Raw text used when no history lines are supplied.
    pub fallback_text: String,
    /// Preformatted `speaker: text` lines, oldest first. When present,
    /// the last `history_limit` lines become the transcript.
    pub history_lines: Vec<String>,
    pub context: ConversationContext,
}

/// Context for a retrieval call.
#[derive(Debug, Clone, Default)]
pub struct RetrieveContext {
    pub stream_id: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySystemStats {
    pub total_ingested: u64,
    pub total_skipped_by_throttle: u64,
    pub total_skipped_by_value: u64,
    pub last_build_time: Option<f64>,
    pub last_retrieval_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ValueAssessment {
    #[serde(default)]
    value_score: f64,
    #[serde(default)]
    reasoning: String,
}

pub struct MemorySystem {
    config: MemoryConfig,
    llm: Arc<dyn LlmProvider>,
    store: Arc<MemoryStore>,
    extractor: MemoryExtractor,
    fusion: MemoryFusion,
    retriever: MemoryRetriever,
    status: RwLock<MemorySystemStatus>,
    last_build_times: Mutex<HashMap<String, f64>>,
    fingerprints: Mutex<HashMap<String, Uuid>>,
    stats: Mutex<MemorySystemStats>,
}

impl MemorySystem {
    pub fn new(
        config: MemoryConfig,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        bot_name: impl Into<String>,
        bot_aliases: Vec<String>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(
            vectors,
            embedder,
            config.cache_size,
        ));
        let extractor = MemoryExtractor::new(
            llm.clone(),
            bot_name,
            bot_aliases,
            Duration::from_secs(config.llm_timeout_secs),
        );
        Self {
            fusion: MemoryFusion::new(config.fusion_threshold),
            retriever: MemoryRetriever::new(config.clone()),
            extractor,
            store,
            llm,
            config,
            status: RwLock::new(MemorySystemStatus::Initializing),
            last_build_times: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            stats: Mutex::new(MemorySystemStats::default()),
        }
    }

    /// Create collections, verify the embedding dimension, and warm the
    /// fingerprint map. Failure here aborts boot.
    pub async fn initialize(&self) -> Result<(), MemoryError> {
        let provider_dim = self.store.embedder().dimension();
        if provider_dim != self.config.embedding_dimension {
            *self.status.write().await = MemorySystemStatus::Error;
            return Err(MemoryError::DimensionMismatch {
                configured: self.config.embedding_dimension,
                provider: provider_dim,
            });
        }

        self.store.initialize().await?;

        let existing = self
            .store
            .get_by_filter(
                MetadataFilter::default().eq("user_id", serde_json::json!(GLOBAL_SCOPE)),
                usize::MAX,
            )
            .await?;
        let mut fingerprints = self.fingerprints.lock().await;
        for chunk in &existing {
            fingerprints.insert(content_fingerprint(chunk), chunk.id);
        }
        drop(fingerprints);

        info!(existing = existing.len(), "memory system initialized");
        *self.status.write().await = MemorySystemStatus::Ready;
        Ok(())
    }

    pub async fn status(&self) -> MemorySystemStatus {
        *self.status.read().await
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub async fn stats(&self) -> MemorySystemStats {
        self.stats.lock().await.clone()
    }

    // ── Ingest ─────────────────────────────────────────────────────────────

    pub async fn ingest_conversation(&self, request: IngestRequest) -> Result<Vec<MemoryChunk>> {
        let now = if request.context.timestamp > 0.0 {
            request.context.timestamp
        } else {
            Utc::now().timestamp() as f64
        };
        let scope_key = request
            .context
            .stream_id
            .clone()
            .or_else(|| request.context.user_id.clone())
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string());

        // Per-scope build throttle.
        {
            let mut build_times = self.last_build_times.lock().await;
            if let Some(last) = build_times.get(&scope_key) {
                let elapsed = now - last;
                if elapsed < self.config.min_build_interval_secs {
                    info!(
                        scope = %scope_key,
                        remaining = self.config.min_build_interval_secs - elapsed,
                        "memory build throttled"
                    );
                    self.stats.lock().await.total_skipped_by_throttle += 1;
                    return Ok(Vec::new());
                }
            }
            build_times.insert(scope_key.clone(), now);
        }

        *self.status.write().await = MemorySystemStatus::Building;
        let result = self.build_memories(&request, &scope_key, now).await;
        *self.status.write().await = MemorySystemStatus::Ready;
        result
    }

    async fn build_memories(
        &self,
        request: &IngestRequest,
        scope_key: &str,
        now: f64,
    ) -> Result<Vec<MemoryChunk>> {
        let transcript = self.resolve_transcript(request);
        if transcript.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value_score = self.assess_information_value(&transcript, &request.context).await;
        if value_score < self.config.value_threshold {
            info!(value_score, "conversation below value threshold, skipping");
            let mut stats = self.stats.lock().await;
            stats.total_skipped_by_value += 1;
            return Ok(Vec::new());
        }

        let mut context = request.context.clone();
        context.timestamp = now;
        let mut chunks = match self.extractor.extract(&transcript, &context).await {
            Ok(chunks) => chunks,
            Err(MemoryError::ExtractionParse(reason)) => {
                // Non-fatal: release the throttle marker so the next
                // window may try again.
                warn!(%reason, "memory extraction unparseable, skipping window");
                self.last_build_times.lock().await.remove(scope_key);
                return Ok(Vec::new());
            }
            Err(other) => return Err(other.into()),
        };
        if chunks.is_empty() {
            debug!("no valid memories extracted");
            return Ok(Vec::new());
        }

        // Embeddings are needed before fusion can compare cosines.
        for chunk in &mut chunks {
            if chunk.embedding.is_none() {
                let embedding = self.store.embedder().embed(&chunk.text_content()).await?;
                chunk.set_embedding(embedding);
            }
        }

        let candidates = self.collect_fusion_candidates(&chunks).await?;
        let outcome = self.fusion.fuse(chunks, candidates, now);

        for merged in &outcome.merged {
            self.store.update(merged).await?;
        }
        let mut inserted = outcome.inserted;
        let written = self.store.insert(&mut inserted).await?;

        {
            let mut fingerprints = self.fingerprints.lock().await;
            for chunk in &inserted {
                fingerprints.insert(content_fingerprint(chunk), chunk.id);
            }
        }

        let mut produced = inserted;
        produced.extend(outcome.merged);
        self.log_preview(&produced);

        let mut stats = self.stats.lock().await;
        stats.total_ingested += written as u64;
        stats.last_build_time = Some(now);
        info!(
            produced = produced.len(),
            written,
            merged = produced.len() - written,
            "memory build finished"
        );
        Ok(produced)
    }

    fn resolve_transcript(&self, request: &IngestRequest) -> String {
        if request.history_lines.is_empty() {
            return request.fallback_text.clone();
        }
        let skip = request
            .history_lines
            .len()
            .saturating_sub(self.config.history_limit);
        request.history_lines[skip..].join("\n")
    }

    async fn collect_fusion_candidates(
        &self,
        chunks: &[MemoryChunk],
    ) -> Result<Vec<MemoryChunk>> {
        let mut candidate_ids: Vec<Uuid> = Vec::new();
        let new_ids: Vec<Uuid> = chunks.iter().map(|c| c.id).collect();

        // Direct fingerprint hits.
        {
            let fingerprints = self.fingerprints.lock().await;
            for chunk in chunks {
                if let Some(id) = fingerprints.get(&content_fingerprint(chunk)) {
                    if !new_ids.contains(id) && !candidate_ids.contains(id) {
                        candidate_ids.push(*id);
                    }
                }
            }
        }

        // Vector neighbors near each candidate's display, searched
        // concurrently.
        let floor = (self.config.fusion_threshold * 0.8) as f32;
        let searches = chunks.iter().filter_map(|chunk| {
            let display = chunk.display().trim().to_string();
            if display.is_empty() {
                return None;
            }
            Some(async move {
                match &chunk.embedding {
                    Some(embedding) => {
                        self.store.search_similar_embedding(embedding, 8, None).await
                    }
                    None => self.store.search_similar(&display, 8, None).await,
                }
            })
        });
        for result in futures::future::join_all(searches).await {
            let neighbors = match result {
                Ok(neighbors) => neighbors,
                Err(err) => {
                    warn!(%err, "fusion candidate search failed");
                    continue;
                }
            };
            for (neighbor, similarity) in neighbors {
                if similarity < floor {
                    continue;
                }
                if new_ids.contains(&neighbor.id) || candidate_ids.contains(&neighbor.id) {
                    continue;
                }
                candidate_ids.push(neighbor.id);
            }
        }

        let mut candidates = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            if let Some(chunk) = self.store.get_by_id(id).await? {
                candidates.push(chunk);
            }
        }
        Ok(candidates)
    }

    async fn assess_information_value(&self, text: &str, context: &ConversationContext) -> f64 {
        let prompt = build_value_prompt(text, context);
        let options = GenerateOptions::constrained(RequestKind::ValueAssessment);
        let timeout = Duration::from_secs(self.config.llm_timeout_secs);

        let response = match tokio::time::timeout(timeout, self.llm.generate(&prompt, &options)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(%err, "value assessment failed, assuming neutral value");
                return 0.5;
            }
            Err(_) => {
                warn!("value assessment timed out, assuming neutral value");
                return 0.5;
            }
        };

        match llm_json::parse_lenient::<ValueAssessment>(&response) {
            Some(assessment) => {
                info!(
                    score = assessment.value_score,
                    reasoning = %assessment.reasoning,
                    "information value assessed"
                );
                assessment.value_score.clamp(0.0, 1.0)
            }
            None => {
                warn!("value assessment unparseable, assuming neutral value");
                0.5
            }
        }
    }

    fn log_preview(&self, memories: &[MemoryChunk]) {
        if memories.is_empty() {
            return;
        }
        info!(count = memories.len(), "memory preview:");
        for (index, memory) in memories.iter().enumerate() {
            let mut text = memory.text_content();
            if text.chars().count() > 120 {
                text = text.chars().take(117).collect::<String>() + "...";
            }
            info!(
                "  {}) type={} importance={} confidence={} | {}",
                index + 1,
                memory.memory_type.slug(),
                memory.importance.value(),
                memory.confidence.value(),
                text
            );
        }
    }

    // ── Retrieve ───────────────────────────────────────────────────────────

    pub async fn retrieve(
        &self,
        query: &str,
        context: &RetrieveContext,
        limit: usize,
    ) -> Result<Vec<MemoryChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        *self.status.write().await = MemorySystemStatus::Retrieving;
        let plan = self.plan_query(query).await;
        let now = Utc::now().timestamp() as f64;

        let result = self
            .retriever
            .retrieve(&self.store, query, &plan, &context.keywords, now, limit)
            .await;
        *self.status.write().await = MemorySystemStatus::Ready;

        let (memories, report) = result?;
        debug!(
            query,
            found = memories.len(),
            fallback = report.metadata_fallback,
            "memory retrieval finished"
        );
        self.stats.lock().await.last_retrieval_time = Some(now);
        Ok(memories)
    }

    /// Ask the query planner for a structured plan; any failure falls
    /// back to an unconstrained default.
    async fn plan_query(&self, query: &str) -> QueryPlan {
        let prompt = build_query_plan_prompt(query);
        let options = GenerateOptions::constrained(RequestKind::QueryPlanning);
        let timeout = Duration::from_secs(self.config.llm_timeout_secs);

        let response = match tokio::time::timeout(timeout, self.llm.generate(&prompt, &options)).await
        {
            Ok(Ok(response)) => response,
            _ => {
                debug!("query planning unavailable, using default plan");
                return QueryPlan::default();
            }
        };

        llm_json::parse_lenient::<QueryPlan>(&response).unwrap_or_else(|| {
            debug!("query plan unparseable, using default plan");
            QueryPlan::default()
        })
    }
}

fn build_value_prompt(text: &str, context: &ConversationContext) -> String {
    let user = context
        .user_display_name
        .clone()
        .or_else(|| context.user_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        r#"请评估以下对话内容的信息价值，重点识别个人事实、事件、偏好、观点等值得长期记忆的内容。

评分标准：
- 0.7-1.0：个人事实（姓名、职业、住址、联系方式）、重要事件、明确偏好、观点态度、核心人际关系
- 0.4-0.7：情感表达、日常活动、一般兴趣、短期计划
- 0.0-0.4：寒暄问候、重复信息、临时状态、与用户画像无关的内容

对话内容：
{text}

参与用户：{user}

请以JSON输出：
{{"value_score": 0.0到1.0之间的数值, "reasoning": "评估理由"}}
"#
    )
}

fn build_query_plan_prompt(query: &str) -> String {
    format!(
        r#"请为以下记忆检索请求生成查询计划。

检索请求：{query}

可用的memory_types：personal_fact, event, preference, opinion, relationship, emotion, knowledge, skill, goal, experience, contextual

请以JSON输出（不需要的字段可省略）：
{{
  "memory_types": ["personal_fact"],
  "subject_includes": ["相关人名"],
  "required_keywords": [],
  "optional_keywords": [],
  "semantic_query": "改写后的检索语句",
  "recency_preference": "recent|historical",
  "emphasis": "precision|recall"
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use murmur_llm::{GenerateOptions, LlmProvider, RequestKind};

    use crate::store::InMemoryVectorStore;
    use crate::store::test_support::HashingEmbedder;

    use super::*;

    /// Scripted LLM: answers by request kind, counting calls.
    struct ScriptedLlm {
        value_response: String,
        extraction_response: String,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(value_response: &str, extraction_response: &str) -> Self {
            Self {
                value_response: value_response.to_string(),
                extraction_response: extraction_response.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, _prompt: &str, options: &GenerateOptions) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match options.request {
                RequestKind::ValueAssessment => self.value_response.clone(),
                RequestKind::MemoryExtraction => self.extraction_response.clone(),
                _ => "{}".to_string(),
            })
        }
    }

    const EXTRACTION: &str = r#"{"memories": [{"type": "personal_fact",
        "display": "小明居住在北京", "subject": ["小明"], "predicate": "lives_in",
        "object": {"location": "北京"}, "keywords": ["北京"],
        "importance": 3, "confidence": 3}]}"#;

    fn system(llm: ScriptedLlm) -> MemorySystem {
        let mut config = MemoryConfig {
            embedding_dimension: 64,
            min_build_interval_secs: 300.0,
            ..MemoryConfig::default()
        };
        config.vector_similarity_threshold = 0.2;
        config.semantic_similarity_threshold = 0.05;
        MemorySystem::new(
            config,
            Arc::new(llm),
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(InMemoryVectorStore::new()),
            "Murmur",
            Vec::new(),
        )
    }

    fn request(at: f64) -> IngestRequest {
        IngestRequest {
            fallback_text: "小明说：我现在住在北京，搬过来已经三个月了，感觉这里的生活节奏很快但是很有意思，周末经常去各个公园散步，还打算找一个羽毛球俱乐部加入。".to_string(),
            history_lines: Vec::new(),
            context: ConversationContext {
                stream_id: Some("s1".to_string()),
                user_id: Some("u1".to_string()),
                user_display_name: Some("小明".to_string()),
                participants: vec!["小明".to_string()],
                timestamp: at,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_initialization() {
        let system = MemorySystem::new(
            MemoryConfig {
                embedding_dimension: 768,
                ..MemoryConfig::default()
            },
            Arc::new(ScriptedLlm::new("{}", "{}")),
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(InMemoryVectorStore::new()),
            "Murmur",
            Vec::new(),
        );
        let err = system.initialize().await.unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn low_value_conversation_writes_nothing() -> Result<()> {
        let system = system(ScriptedLlm::new(
            r#"{"value_score": 0.1, "reasoning": "寒暄"}"#,
            EXTRACTION,
        ));
        system.initialize().await?;

        let produced = system.ingest_conversation(request(1_700_000_000.0)).await?;
        assert!(produced.is_empty());
        assert_eq!(system.store().count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn valuable_conversation_is_extracted_and_persisted() -> Result<()> {
        let system = system(ScriptedLlm::new(
            r#"{"value_score": 0.9, "reasoning": "个人事实"}"#,
            EXTRACTION,
        ));
        system.initialize().await?;

        let produced = system.ingest_conversation(request(1_700_000_000.0)).await?;
        assert_eq!(produced.len(), 1);
        assert_eq!(system.store().count().await?, 1);
        assert_eq!(produced[0].display(), "小明居住在北京");
        Ok(())
    }

    #[tokio::test]
    async fn second_build_within_throttle_window_is_skipped() -> Result<()> {
        let system = system(ScriptedLlm::new(
            r#"{"value_score": 0.9, "reasoning": "ok"}"#,
            EXTRACTION,
        ));
        system.initialize().await?;

        let first = system.ingest_conversation(request(1_700_000_000.0)).await?;
        assert!(!first.is_empty());

        let second = system.ingest_conversation(request(1_700_000_060.0)).await?;
        assert!(second.is_empty());
        assert_eq!(system.stats().await.total_skipped_by_throttle, 1);
        Ok(())
    }

    #[tokio::test]
    async fn identical_extraction_fuses_instead_of_growing_the_store() -> Result<()> {
        let system = system(ScriptedLlm::new(
            r#"{"value_score": 0.9, "reasoning": "ok"}"#,
            EXTRACTION,
        ));
        system.initialize().await?;

        let first = system.ingest_conversation(request(1_700_000_000.0)).await?;
        assert_eq!(first.len(), 1);
        let first_id = first[0].id;
        let before_modified = first[0].last_modified;

        // Outside the throttle window, same extraction again.
        let second = system.ingest_conversation(request(1_700_000_500.0)).await?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first_id, "merged into the existing record");

        assert_eq!(system.store().count().await?, 1);
        let stored = system.store().get_by_id(first_id).await?.unwrap();
        assert!(stored.last_modified > before_modified);
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_extraction_degrades_to_empty_and_releases_throttle() -> Result<()> {
        let system = system(ScriptedLlm::new(
            r#"{"value_score": 0.9, "reasoning": "ok"}"#,
            "definitely not json",
        ));
        system.initialize().await?;

        let produced = system.ingest_conversation(request(1_700_000_000.0)).await?;
        assert!(produced.is_empty());
        assert_eq!(system.store().count().await?, 0);

        // The throttle marker was rolled back, so an immediate retry is
        // allowed rather than silently skipped.
        let retry = system.ingest_conversation(request(1_700_000_010.0)).await?;
        assert!(retry.is_empty());
        assert_eq!(system.stats().await.total_skipped_by_throttle, 0);
        Ok(())
    }
}
