//! Four-stage memory retrieval: metadata filter → vector search →
//! semantic rerank → contextual scoring.
//!
//! Each stage narrows the candidate set. Stage 4 blends
//! `w_sem·jaccard + w_vec·cosine + w_ctx·context + w_rec·recency`,
//! scaled by `0.7 + 0.3·importance/4`; emphasis shifts +0.05 onto the
//! semantic (precision) or contextual (recall) weight.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use murmur_config::MemoryConfig;

use crate::chunk::{GLOBAL_SCOPE, MemoryChunk, MemoryType, cosine_similarity};
use crate::store::{MemoryStore, MetadataFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyPreference {
    Recent,
    Historical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emphasis {
    Precision,
    Recall,
}

/// Structured retrieval plan, usually produced by a low-temperature
/// query-planning LLM call; all fields default to "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPlan {
    pub memory_types: Vec<MemoryType>,
    pub subject_includes: Vec<String>,
    pub required_keywords: Vec<String>,
    pub optional_keywords: Vec<String>,
    pub object_includes: Vec<String>,
    pub semantic_query: Option<String>,
    pub recency_preference: Option<RecencyPreference>,
    pub emphasis: Option<Emphasis>,
}

/// Per-stage candidate counts, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RetrievalReport {
    pub metadata_kept: usize,
    pub vector_kept: usize,
    pub rerank_kept: usize,
    pub final_kept: usize,
    pub metadata_fallback: bool,
}

pub struct MemoryRetriever {
    config: MemoryConfig,
}

impl MemoryRetriever {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    pub async fn retrieve(
        &self,
        store: &MemoryStore,
        query: &str,
        plan: &QueryPlan,
        context_keywords: &[String],
        now: f64,
        limit: usize,
    ) -> Result<(Vec<MemoryChunk>, RetrievalReport)> {
        let mut report = RetrievalReport::default();
        let limit = if limit == 0 {
            self.config.final_result_limit
        } else {
            limit
        };

        // Stage 1: metadata filter.
        let candidates = self.metadata_stage(store, plan, &mut report).await?;
        report.metadata_kept = candidates.len();
        if candidates.is_empty() {
            return Ok((Vec::new(), report));
        }

        // Stage 2: vector search over the narrowed candidates.
        let semantic_query = plan.semantic_query.as_deref().unwrap_or(query);
        let (candidates, cosine_by_id) =
            self.vector_stage(store, semantic_query, candidates).await?;
        report.vector_kept = candidates.len();
        if candidates.is_empty() {
            return Ok((Vec::new(), report));
        }

        // Stage 3: lexical rerank.
        let (candidates, jaccard_by_id) = self.rerank_stage(semantic_query, candidates);
        report.rerank_kept = candidates.len();

        // Stage 4: contextual blend.
        let mut scored: Vec<(MemoryChunk, f64)> = candidates
            .into_iter()
            .map(|chunk| {
                let score = self.final_score(
                    &chunk,
                    plan,
                    context_keywords,
                    jaccard_by_id.get(&chunk.id).copied().unwrap_or(0.0),
                    cosine_by_id.get(&chunk.id).copied().unwrap_or(0.0) as f64,
                    now,
                );
                (chunk, score)
            })
            .collect();
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        scored.truncate(limit);
        report.final_kept = scored.len();

        let mut results = Vec::with_capacity(scored.len());
        for (mut chunk, score) in scored {
            chunk.record_access(now);
            chunk.relevance_score = chunk.relevance_score.max(score);
            store.update(&chunk).await?;
            results.push(chunk);
        }

        debug!(
            metadata = report.metadata_kept,
            vector = report.vector_kept,
            rerank = report.rerank_kept,
            finalists = report.final_kept,
            "retrieval pipeline finished"
        );
        Ok((results, report))
    }

    // ── Stage 1 ────────────────────────────────────────────────────────────

    async fn metadata_stage(
        &self,
        store: &MemoryStore,
        plan: &QueryPlan,
        report: &mut RetrievalReport,
    ) -> Result<Vec<MemoryChunk>> {
        let scope_filter = MetadataFilter::default().eq("user_id", json!(GLOBAL_SCOPE));
        let mut all = store.get_by_filter(scope_filter, usize::MAX).await?;
        all.sort_by(|a, b| b.last_accessed.total_cmp(&a.last_accessed));

        let strict: Vec<MemoryChunk> = all
            .iter()
            .filter(|chunk| {
                type_matches(chunk, &plan.memory_types)
                    && subject_matches(chunk, &plan.subject_includes)
                    && keyword_matches(chunk, &plan.required_keywords)
            })
            .cloned()
            .collect();

        if !strict.is_empty() {
            let mut kept = strict;
            kept.truncate(self.config.metadata_filter_limit);
            return Ok(kept);
        }

        // Index miss: fall back to recently-accessed memories, pruning
        // with each constraint only where it leaves something behind.
        report.metadata_fallback = true;
        let constraints: [&dyn Fn(&MemoryChunk) -> bool; 3] = [
            &|c| type_matches(c, &plan.memory_types),
            &|c| subject_matches(c, &plan.subject_includes),
            &|c| keyword_matches(c, &plan.required_keywords),
        ];
        let mut pool = all;
        for constraint in constraints {
            let narrowed: Vec<MemoryChunk> = pool.iter().filter(|c| constraint(c)).cloned().collect();
            if !narrowed.is_empty() {
                pool = narrowed;
            }
        }
        pool.truncate(self.config.metadata_filter_limit);
        Ok(pool)
    }

    // ── Stage 2 ────────────────────────────────────────────────────────────

    async fn vector_stage(
        &self,
        store: &MemoryStore,
        semantic_query: &str,
        candidates: Vec<MemoryChunk>,
    ) -> Result<(Vec<MemoryChunk>, HashMap<Uuid, f32>)> {
        let query_embedding = store.embedder().embed(semantic_query).await?;

        let mut scored: Vec<(MemoryChunk, f32)> = candidates
            .into_iter()
            .filter_map(|chunk| {
                let similarity = chunk
                    .embedding
                    .as_deref()
                    .map(|embedding| cosine_similarity(embedding, &query_embedding))?;
                (similarity >= self.config.vector_similarity_threshold as f32)
                    .then_some((chunk, similarity))
            })
            .collect();
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        scored.truncate(self.config.vector_search_limit);

        let similarities = scored
            .iter()
            .map(|(chunk, sim)| (chunk.id, *sim))
            .collect();
        Ok((scored.into_iter().map(|(chunk, _)| chunk).collect(), similarities))
    }

    // ── Stage 3 ────────────────────────────────────────────────────────────

    fn rerank_stage(
        &self,
        semantic_query: &str,
        candidates: Vec<MemoryChunk>,
    ) -> (Vec<MemoryChunk>, HashMap<Uuid, f64>) {
        let query_tokens = tokenize(semantic_query);

        let mut scored: Vec<(MemoryChunk, f64)> = candidates
            .into_iter()
            .filter_map(|chunk| {
                let text = format!("{} {}", chunk.display(), chunk.text_content());
                let similarity = jaccard(&query_tokens, &tokenize(&text));
                (similarity >= self.config.semantic_similarity_threshold)
                    .then_some((chunk, similarity))
            })
            .collect();
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        scored.truncate(self.config.semantic_rerank_limit);

        let similarities = scored
            .iter()
            .map(|(chunk, sim)| (chunk.id, *sim))
            .collect();
        (scored.into_iter().map(|(chunk, _)| chunk).collect(), similarities)
    }

    // ── Stage 4 ────────────────────────────────────────────────────────────

    fn final_score(
        &self,
        chunk: &MemoryChunk,
        plan: &QueryPlan,
        context_keywords: &[String],
        jaccard_score: f64,
        cosine_score: f64,
        now: f64,
    ) -> f64 {
        let context_score = self.context_score(chunk, plan, context_keywords, now);

        let mut recency = recency_score(now - chunk.created_at);
        match plan.recency_preference {
            Some(RecencyPreference::Recent) => recency = recency.max(0.8),
            Some(RecencyPreference::Historical) => recency = recency.min(0.5),
            None => {}
        }

        let mut semantic_weight = self.config.semantic_weight;
        let mut context_weight = self.config.context_weight;
        match plan.emphasis {
            Some(Emphasis::Precision) => semantic_weight += 0.05,
            Some(Emphasis::Recall) => context_weight += 0.05,
            None => {}
        }

        let blended = jaccard_score * semantic_weight
            + cosine_score * self.config.vector_weight
            + context_score * context_weight
            + recency * self.config.recency_weight;

        let importance = chunk.importance.value() as f64 / 4.0;
        blended * (0.7 + importance * 0.3)
    }

    fn context_score(
        &self,
        chunk: &MemoryChunk,
        plan: &QueryPlan,
        context_keywords: &[String],
        now: f64,
    ) -> f64 {
        let mut score = 0.0;
        let display = format!("{} {}", chunk.display(), chunk.text_content()).to_lowercase();

        if !plan.memory_types.is_empty() && plan.memory_types.contains(&chunk.memory_type) {
            score += 0.3;
        }

        if !context_keywords.is_empty() {
            let chunk_keywords: BTreeSet<String> =
                chunk.keywords.iter().map(|k| k.to_lowercase()).collect();
            let overlap = context_keywords
                .iter()
                .filter(|k| chunk_keywords.contains(&k.to_lowercase()))
                .count();
            score += overlap as f64 / context_keywords.len() as f64 * 0.4;
        }

        score += subject_overlap(chunk, &plan.subject_includes) * 0.3;

        let object_hits = plan
            .object_includes
            .iter()
            .filter(|kw| !kw.trim().is_empty() && display.contains(&kw.trim().to_lowercase()))
            .count();
        if object_hits > 0 {
            score += (object_hits as f64 * 0.1).min(0.3);
        }

        let optional_hits = plan
            .optional_keywords
            .iter()
            .filter(|kw| !kw.trim().is_empty() && display.contains(&kw.trim().to_lowercase()))
            .count();
        if optional_hits > 0 {
            score += (optional_hits as f64 * 0.05).min(0.2);
        }

        let age = now - chunk.created_at;
        match plan.recency_preference {
            Some(RecencyPreference::Recent) if age < 7.0 * 86_400.0 => score += 0.2,
            Some(RecencyPreference::Historical) if age > 30.0 * 86_400.0 => score += 0.1,
            _ => {}
        }

        score.min(1.0)
    }
}

fn type_matches(chunk: &MemoryChunk, types: &[MemoryType]) -> bool {
    types.is_empty() || types.contains(&chunk.memory_type)
}

fn subject_matches(chunk: &MemoryChunk, includes: &[String]) -> bool {
    if includes.is_empty() {
        return true;
    }
    let lowered: Vec<String> = includes
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    chunk
        .content
        .subjects
        .iter()
        .any(|subject| lowered.contains(&subject.trim().to_lowercase()))
}

fn keyword_matches(chunk: &MemoryChunk, required: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }
    let text = format!("{} {}", chunk.display(), chunk.text_content()).to_lowercase();
    required
        .iter()
        .any(|kw| !kw.trim().is_empty() && text.contains(&kw.trim().to_lowercase()))
}

/// Fraction of requested subjects that appear (substring) in the
/// chunk's subject list.
fn subject_overlap(chunk: &MemoryChunk, includes: &[String]) -> f64 {
    if includes.is_empty() {
        return 0.0;
    }
    let subjects: Vec<String> = chunk
        .content
        .subjects
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    if subjects.is_empty() {
        return 0.0;
    }

    let mut hits = 0usize;
    let mut total = 0usize;
    for include in includes {
        let normalized = include.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        total += 1;
        if subjects.iter().any(|s| s.contains(&normalized)) {
            hits += 1;
        }
    }
    if total == 0 { 0.0 } else { hits as f64 / total as f64 }
}

/// Stepwise recency: <1d → 1.0, <7d → 0.8, <30d → 0.6, <90d → 0.4,
/// else 0.2.
fn recency_score(age_secs: f64) -> f64 {
    let age_days = age_secs.max(0.0) / 86_400.0;
    if age_days < 1.0 {
        1.0
    } else if age_days < 7.0 {
        0.8
    } else if age_days < 30.0 {
        0.6
    } else if age_days < 90.0 {
        0.4
    } else {
        0.2
    }
}

/// Token set for lexical overlap: lowercased ASCII words of length ≥ 2
/// plus individual CJK characters, so unsegmented Chinese still
/// overlaps character-wise.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut ascii_run = String::new();
        for ch in word.chars() {
            if ch.is_ascii_alphanumeric() {
                ascii_run.push(ch.to_ascii_lowercase());
            } else {
                if ascii_run.len() >= 2 {
                    tokens.insert(std::mem::take(&mut ascii_run));
                } else {
                    ascii_run.clear();
                }
                tokens.insert(ch.to_string());
            }
        }
        if ascii_run.len() >= 2 {
            tokens.insert(ascii_run);
        }
    }
    tokens
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use crate::chunk::{
        ConfidenceLevel, ImportanceLevel, MemoryChunk, MemoryContent, MemoryType, ObjectValue,
    };
    use crate::store::test_support::HashingEmbedder;
    use crate::store::{InMemoryVectorStore, MemoryStore};

    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig {
            // The hashing test embedder produces coarser vectors than a
            // real model; relax the floors accordingly.
            vector_similarity_threshold: 0.2,
            semantic_similarity_threshold: 0.1,
            ..MemoryConfig::default()
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashingEmbedder::new(64)),
            16,
        )
    }

    fn chunk(
        subject: &str,
        predicate: &str,
        object: &str,
        memory_type: MemoryType,
        created_at: f64,
    ) -> MemoryChunk {
        let content = MemoryContent::new(
            vec![subject.to_string()],
            predicate,
            ObjectValue::Text(object.to_string()),
        );
        let mut chunk = MemoryChunk::new(
            content,
            memory_type,
            ImportanceLevel::Normal,
            ConfidenceLevel::Medium,
            created_at,
        );
        chunk.last_accessed = created_at;
        chunk
    }

    const NOW: f64 = 1_700_000_000.0;

    #[tokio::test]
    async fn plan_filters_narrow_then_rank_by_similarity() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![
            chunk("小明", "居住在", "北京", MemoryType::PersonalFact, NOW - 3_600.0),
            chunk("小明", "喜欢", "拉面", MemoryType::Preference, NOW - 86_400.0 * 3.0),
            chunk("小红", "明天考试", "数学", MemoryType::Event, NOW - 600.0),
        ];
        store.insert(&mut chunks).await?;

        let retriever = MemoryRetriever::new(config());
        let plan = QueryPlan {
            memory_types: vec![MemoryType::PersonalFact],
            subject_includes: vec!["小明".to_string()],
            ..QueryPlan::default()
        };
        let (results, report) = retriever
            .retrieve(&store, "小明住哪里", &plan, &[], NOW, 1)
            .await?;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, chunks[0].id);
        assert!(!report.metadata_fallback);
        Ok(())
    }

    #[tokio::test]
    async fn fallback_expands_when_strict_filters_miss() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![chunk(
            "小明",
            "喜欢",
            "拉面",
            MemoryType::Preference,
            NOW - 3_600.0,
        )];
        store.insert(&mut chunks).await?;

        let retriever = MemoryRetriever::new(config());
        // No Goal memories exist: the type constraint misses and the
        // fallback keeps the recent pool instead.
        let plan = QueryPlan {
            memory_types: vec![MemoryType::Goal],
            ..QueryPlan::default()
        };
        let (results, report) = retriever
            .retrieve(&store, "小明 喜欢 拉面", &plan, &[], NOW, 5)
            .await?;

        assert!(report.metadata_fallback);
        assert_eq!(results.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn results_are_bounded_and_access_counted() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks: Vec<MemoryChunk> = (0..8)
            .map(|i| {
                chunk(
                    "小明",
                    "提到",
                    &format!("话题{i} 关于小明的事情"),
                    MemoryType::Contextual,
                    NOW - 60.0 * i as f64,
                )
            })
            .collect();
        store.insert(&mut chunks).await?;

        let retriever = MemoryRetriever::new(config());
        let (results, _) = retriever
            .retrieve(&store, "小明 的 话题", &QueryPlan::default(), &[], NOW, 3)
            .await?;

        assert!(results.len() <= 3);
        for result in &results {
            assert_eq!(result.access_count, 1);
            assert_eq!(result.last_accessed, NOW);
            // The persisted copy carries the bookkeeping too.
            let stored = store.get_by_id(result.id).await?.unwrap();
            assert_eq!(stored.access_count, 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn below_floor_candidates_never_resurface() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![
            chunk("小明", "喜欢", "拉面", MemoryType::Preference, NOW),
            chunk("zzz", "unrelated", "qqqq wwww eeee", MemoryType::Knowledge, NOW),
        ];
        store.insert(&mut chunks).await?;

        let mut cfg = config();
        cfg.vector_similarity_threshold = 0.9;
        let retriever = MemoryRetriever::new(cfg);
        let (results, _) = retriever
            .retrieve(&store, "小明喜欢拉面", &QueryPlan::default(), &[], NOW, 5)
            .await?;

        // Whatever survives passed the vector floor; the unrelated
        // chunk cannot be resurrected by contextual rescoring.
        assert!(results.iter().all(|c| c.content.subjects[0] != "zzz"));
        Ok(())
    }

    #[test]
    fn tokenizer_emits_cjk_chars_and_ascii_words() {
        let tokens = tokenize("小明 likes ramen 拉面");
        assert!(tokens.contains("小"));
        assert!(tokens.contains("明"));
        assert!(tokens.contains("likes"));
        assert!(tokens.contains("ramen"));
        assert!(tokens.contains("拉"));
    }

    #[test]
    fn recency_steps_match_the_age_bands() {
        assert_eq!(recency_score(3_600.0), 1.0);
        assert_eq!(recency_score(2.0 * 86_400.0), 0.8);
        assert_eq!(recency_score(10.0 * 86_400.0), 0.6);
        assert_eq!(recency_score(45.0 * 86_400.0), 0.4);
        assert_eq!(recency_score(100.0 * 86_400.0), 0.2);
    }

    #[test]
    fn query_plan_parses_from_llm_json() {
        let raw = r#"{"memory_types": ["personal_fact"], "subject_includes": ["小明"],
                      "semantic_query": "小明的住址", "recency_preference": "recent",
                      "emphasis": "precision"}"#;
        let plan: QueryPlan = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.memory_types, vec![MemoryType::PersonalFact]);
        assert_eq!(plan.recency_preference, Some(RecencyPreference::Recent));
        assert_eq!(plan.emphasis, Some(Emphasis::Precision));
    }
}
