//! Vector-store abstraction and the chunk-level store built on top.
//!
//! The driver behind [`VectorStore`] is injected; the workspace ships
//! [`InMemoryVectorStore`] as the reference implementation. Distances
//! are `1 − cosine_similarity`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_llm::EmbeddingProvider;

use crate::chunk::{MemoryChunk, cosine_similarity};

/// Collection holding one record per [`MemoryChunk`].
pub const MEMORY_COLLECTION: &str = "murmur_memories";
/// Reserved for auxiliary light-weight projections.
pub const METADATA_COLLECTION: &str = "murmur_memory_metadata";

/// Conjunctive metadata filter: every `equals` pair must match and every
/// `less_than` field must be numerically below the bound.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub equals: Vec<(String, Value)>,
    pub less_than: Vec<(String, f64)>,
}

impl MetadataFilter {
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    pub fn lt(mut self, key: impl Into<String>, bound: f64) -> Self {
        self.less_than.push((key.into(), bound));
        self
    }

    pub fn matches(&self, metadata: &serde_json::Map<String, Value>) -> bool {
        for (key, expected) in &self.equals {
            if metadata.get(key) != Some(expected) {
                return false;
            }
        }
        for (key, bound) in &self.less_than {
            match metadata.get(key).and_then(Value::as_f64) {
                Some(actual) if actual < *bound => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub enum RecordSelector {
    Ids(Vec<String>),
    Where(MetadataFilter),
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub record: VectorRecord,
    /// `1 − cosine_similarity` to the query embedding.
    pub distance: f32,
}

/// Injected vector-database driver.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str) -> Result<()>;

    /// Upsert a batch of records.
    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()>;

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;

    async fn get(
        &self,
        collection: &str,
        selector: RecordSelector,
        limit: usize,
    ) -> Result<Vec<VectorRecord>>;

    async fn delete(&self, collection: &str, selector: RecordSelector) -> Result<usize>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

// ── In-memory reference driver ────────────────────────────────────────────────

/// Reference [`VectorStore`] used by tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let slot = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("unknown collection: {collection}"))?;
        for record in records {
            slot.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let collections = self.collections.read().await;
        let slot = collections
            .get(collection)
            .ok_or_else(|| anyhow!("unknown collection: {collection}"))?;

        let mut matches: Vec<VectorMatch> = slot
            .values()
            .filter(|record| filter.is_none_or(|f| f.matches(&record.metadata)))
            .map(|record| VectorMatch {
                distance: 1.0 - cosine_similarity(&record.embedding, embedding),
                record: record.clone(),
            })
            .collect();

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(n);
        Ok(matches)
    }

    async fn get(
        &self,
        collection: &str,
        selector: RecordSelector,
        limit: usize,
    ) -> Result<Vec<VectorRecord>> {
        let collections = self.collections.read().await;
        let slot = collections
            .get(collection)
            .ok_or_else(|| anyhow!("unknown collection: {collection}"))?;

        let records = match selector {
            RecordSelector::Ids(ids) => ids
                .iter()
                .filter_map(|id| slot.get(id).cloned())
                .take(limit)
                .collect(),
            RecordSelector::Where(filter) => slot
                .values()
                .filter(|record| filter.matches(&record.metadata))
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(records)
    }

    async fn delete(&self, collection: &str, selector: RecordSelector) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let slot = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("unknown collection: {collection}"))?;

        let before = slot.len();
        match selector {
            RecordSelector::Ids(ids) => {
                for id in ids {
                    slot.remove(&id);
                }
            }
            RecordSelector::Where(filter) => {
                slot.retain(|_, record| !filter.matches(&record.metadata));
            }
        }
        Ok(before - slot.len())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, HashMap::len))
    }
}

// ── Chunk-level store ─────────────────────────────────────────────────────────

/// Snapshot of the hydration-cache counters.
#[derive(Debug, Clone, Default)]
pub struct StoreCacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Append-only chunk store over an injected [`VectorStore`], with an
/// LRU cache of hydrated chunks in front of it.
///
/// Each record stores the chunk's `display` as the indexed document,
/// its embedding, projected metadata for filtering, and the fully
/// serialized chunk (`memory_data`) for rehydration.
pub struct MemoryStore {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<Uuid, MemoryChunk>>,
    cache_hits: Mutex<(u64, u64)>,
}

impl MemoryStore {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("max(1) is non-zero");
        Self {
            vectors,
            embedder,
            cache: Mutex::new(LruCache::new(capacity)),
            cache_hits: Mutex::new((0, 0)),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.vectors
            .ensure_collection(MEMORY_COLLECTION)
            .await
            .context("creating memory collection")?;
        self.vectors
            .ensure_collection(METADATA_COLLECTION)
            .await
            .context("creating metadata collection")?;
        Ok(())
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn chunk_to_record(chunk: &MemoryChunk) -> Result<VectorRecord> {
        let embedding = chunk
            .embedding
            .clone()
            .ok_or_else(|| anyhow!("chunk {} has no embedding", chunk.id))?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("user_id".into(), json!(chunk.user_scope));
        metadata.insert(
            "chat_id".into(),
            json!(chunk.chat_scope.clone().unwrap_or_else(|| "unknown".into())),
        );
        metadata.insert("memory_type".into(), json!(chunk.memory_type.slug()));
        metadata.insert(
            "keywords".into(),
            json!(serde_json::to_string(&chunk.keywords)?),
        );
        metadata.insert("importance".into(), json!(chunk.importance.value()));
        metadata.insert("confidence".into(), json!(chunk.confidence.value()));
        metadata.insert("timestamp".into(), json!(chunk.created_at));
        metadata.insert("access_count".into(), json!(chunk.access_count));
        metadata.insert("last_access_time".into(), json!(chunk.last_accessed));
        metadata.insert("source".into(), json!("murmur_memory"));
        metadata.insert("memory_data".into(), json!(serde_json::to_string(chunk)?));

        Ok(VectorRecord {
            id: chunk.id.to_string(),
            embedding,
            document: chunk.display().to_string(),
            metadata,
        })
    }

    fn record_to_chunk(record: &VectorRecord) -> Result<MemoryChunk> {
        let raw = record
            .metadata
            .get("memory_data")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record {} missing memory_data", record.id))?;
        serde_json::from_str(raw).context("rehydrating memory chunk")
    }

    /// Insert a batch, generating embeddings for chunks that lack one.
    /// Returns the number actually written.
    pub async fn insert(&self, chunks: &mut [MemoryChunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        for chunk in chunks.iter_mut() {
            if chunk.embedding.is_none() {
                let text = chunk.text_content();
                let embedding = self.embedder.embed(&text).await?;
                chunk.set_embedding(embedding);
            }
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .map(Self::chunk_to_record)
            .collect::<Result<_>>()?;
        let written = records.len();
        self.vectors.add(MEMORY_COLLECTION, records).await?;

        let mut cache = self.cache.lock().await;
        for chunk in chunks.iter() {
            cache.put(chunk.id, chunk.clone());
        }
        debug!(written, "inserted memory chunks");
        Ok(written)
    }

    /// Rewrite an existing chunk (fusion merge or access bookkeeping).
    pub async fn update(&self, chunk: &MemoryChunk) -> Result<()> {
        let record = Self::chunk_to_record(chunk)?;
        self.vectors.add(MEMORY_COLLECTION, vec![record]).await?;
        self.cache.lock().await.put(chunk.id, chunk.clone());
        Ok(())
    }

    /// Similarity search over documents; returns `(chunk, similarity)`
    /// pairs sorted best-first.
    pub async fn search_similar(
        &self,
        query_text: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<(MemoryChunk, f32)>> {
        let embedding = self.embedder.embed(query_text).await?;
        self.search_similar_embedding(&embedding, limit, filter).await
    }

    pub async fn search_similar_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<(MemoryChunk, f32)>> {
        let matches = self
            .vectors
            .query(MEMORY_COLLECTION, embedding, limit, filter)
            .await?;

        let mut out = Vec::with_capacity(matches.len());
        for m in matches {
            match Self::record_to_chunk(&m.record) {
                Ok(chunk) => out.push((chunk, 1.0 - m.distance)),
                Err(err) => warn!(id = %m.record.id, %err, "skipping unhydratable record"),
            }
        }
        Ok(out)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<MemoryChunk>> {
        {
            let mut cache = self.cache.lock().await;
            let mut counters = self.cache_hits.lock().await;
            if let Some(chunk) = cache.get(&id) {
                counters.0 += 1;
                return Ok(Some(chunk.clone()));
            }
            counters.1 += 1;
        }

        let records = self
            .vectors
            .get(MEMORY_COLLECTION, RecordSelector::Ids(vec![id.to_string()]), 1)
            .await?;
        let Some(record) = records.first() else {
            return Ok(None);
        };
        let chunk = Self::record_to_chunk(record)?;
        self.cache.lock().await.put(id, chunk.clone());
        Ok(Some(chunk))
    }

    pub async fn get_by_filter(
        &self,
        filter: MetadataFilter,
        limit: usize,
    ) -> Result<Vec<MemoryChunk>> {
        let records = self
            .vectors
            .get(MEMORY_COLLECTION, RecordSelector::Where(filter), limit)
            .await?;
        let mut chunks = Vec::with_capacity(records.len());
        for record in &records {
            match Self::record_to_chunk(record) {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => warn!(id = %record.id, %err, "skipping unhydratable record"),
            }
        }
        Ok(chunks)
    }

    pub async fn delete(&self, ids: &[Uuid]) -> Result<usize> {
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let removed = self
            .vectors
            .delete(MEMORY_COLLECTION, RecordSelector::Ids(id_strings))
            .await?;
        let mut cache = self.cache.lock().await;
        for id in ids {
            cache.pop(id);
        }
        Ok(removed)
    }

    pub async fn delete_where(&self, filter: MetadataFilter) -> Result<usize> {
        // The cache may hold survivors only; resolve ids first so the
        // cache stays consistent with the backing store.
        let doomed = self
            .vectors
            .get(MEMORY_COLLECTION, RecordSelector::Where(filter.clone()), usize::MAX)
            .await?;
        let removed = self
            .vectors
            .delete(MEMORY_COLLECTION, RecordSelector::Where(filter))
            .await?;
        let mut cache = self.cache.lock().await;
        for record in doomed {
            if let Ok(id) = record.id.parse::<Uuid>() {
                cache.pop(&id);
            }
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        self.vectors.count(MEMORY_COLLECTION).await
    }

    pub async fn cache_stats(&self) -> StoreCacheStats {
        let cache = self.cache.lock().await;
        let counters = self.cache_hits.lock().await;
        StoreCacheStats {
            capacity: cache.cap().get(),
            len: cache.len(),
            hits: counters.0,
            misses: counters.1,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;

    use murmur_llm::EmbeddingProvider;

    /// Deterministic embedding double: hashes character n-grams into a
    /// small fixed-dimension vector, so equal texts embed equally and
    /// related texts land near each other.
    pub struct HashingEmbedder {
        pub dimension: usize,
    }

    impl HashingEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self { dimension }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for HashingEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut vector = vec![0.0f32; self.dimension];
            for (i, ch) in text.chars().enumerate() {
                let slot = (ch as usize).wrapping_add(i / 8) % self.dimension;
                vector[slot] += 1.0;
            }
            let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            Ok(vector)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::json;

    use crate::chunk::{
        ImportanceLevel, ConfidenceLevel, MemoryChunk, MemoryContent, MemoryType, ObjectValue,
    };

    use super::test_support::HashingEmbedder;
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashingEmbedder::new(32)),
            16,
        )
    }

    fn chunk(display_subject: &str, object: &str) -> MemoryChunk {
        let content = MemoryContent::new(
            vec![display_subject.to_string()],
            "likes",
            ObjectValue::Text(object.to_string()),
        );
        MemoryChunk::new(
            content,
            MemoryType::Preference,
            ImportanceLevel::Normal,
            ConfidenceLevel::Medium,
            1_700_000_000.0,
        )
    }

    #[tokio::test]
    async fn insert_then_get_round_trips_through_metadata() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![chunk("小明", "拉面")];
        let id = chunks[0].id;
        assert_eq!(store.insert(&mut chunks).await?, 1);
        assert_eq!(store.count().await?, 1);

        let loaded = store.get_by_id(id).await?.expect("chunk present");
        assert_eq!(loaded, chunks[0]);
        Ok(())
    }

    #[tokio::test]
    async fn filter_narrows_by_metadata_fields() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut a = vec![chunk("小明", "拉面")];
        let mut b = vec![chunk("小红", "绿茶")];
        b[0].memory_type = MemoryType::PersonalFact;
        store.insert(&mut a).await?;
        store.insert(&mut b).await?;

        let found = store
            .get_by_filter(
                MetadataFilter::default().eq("memory_type", json!("personal_fact")),
                10,
            )
            .await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b[0].id);
        Ok(())
    }

    #[tokio::test]
    async fn similarity_search_prefers_closer_documents() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![chunk("小明", "拉面"), chunk("小红", "完全不同的内容啊")];
        store.insert(&mut chunks).await?;

        let results = store.search_similar("小明 拉面", 2, None).await?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.id, chunks[0].id);
        assert!(results[0].1 >= results[1].1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_where_keeps_cache_consistent() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut chunks = vec![chunk("小明", "拉面")];
        let id = chunks[0].id;
        store.insert(&mut chunks).await?;

        let removed = store
            .delete_where(MetadataFilter::default().eq("memory_type", json!("preference")))
            .await?;
        assert_eq!(removed, 1);
        assert!(store.get_by_id(id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn timestamp_bound_filters_old_records() -> Result<()> {
        let store = store();
        store.initialize().await?;

        let mut old = vec![chunk("小明", "拉面")];
        old[0].created_at = 100.0;
        let mut recent = vec![chunk("小红", "绿茶")];
        recent[0].created_at = 5_000.0;
        store.insert(&mut old).await?;
        store.insert(&mut recent).await?;

        let stale = store
            .get_by_filter(MetadataFilter::default().lt("timestamp", 1_000.0), 10)
            .await?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old[0].id);
        Ok(())
    }
}
