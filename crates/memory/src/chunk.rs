use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// All memories live in one global user scope; per-chat provenance is
/// carried separately in `chat_scope`.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    PersonalFact,
    Event,
    Preference,
    Opinion,
    Relationship,
    Emotion,
    Knowledge,
    Skill,
    Goal,
    Experience,
    Contextual,
}

impl MemoryType {
    pub fn slug(self) -> &'static str {
        match self {
            MemoryType::PersonalFact => "personal_fact",
            MemoryType::Event => "event",
            MemoryType::Preference => "preference",
            MemoryType::Opinion => "opinion",
            MemoryType::Relationship => "relationship",
            MemoryType::Emotion => "emotion",
            MemoryType::Knowledge => "knowledge",
            MemoryType::Skill => "skill",
            MemoryType::Goal => "goal",
            MemoryType::Experience => "experience",
            MemoryType::Contextual => "contextual",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "personal_fact" => Some(MemoryType::PersonalFact),
            "event" => Some(MemoryType::Event),
            "preference" => Some(MemoryType::Preference),
            "opinion" => Some(MemoryType::Opinion),
            "relationship" => Some(MemoryType::Relationship),
            "emotion" => Some(MemoryType::Emotion),
            "knowledge" => Some(MemoryType::Knowledge),
            "skill" => Some(MemoryType::Skill),
            "goal" => Some(MemoryType::Goal),
            "experience" => Some(MemoryType::Experience),
            "contextual" => Some(MemoryType::Contextual),
            _ => None,
        }
    }

    /// Canonical tags attached to every chunk of this type.
    pub fn auto_tags(self) -> &'static [&'static str] {
        match self {
            MemoryType::PersonalFact => &["personal", "profile"],
            MemoryType::Event => &["event", "schedule"],
            MemoryType::Preference => &["preference", "taste"],
            MemoryType::Opinion => &["opinion", "stance"],
            MemoryType::Relationship => &["relationship", "social"],
            MemoryType::Emotion => &["emotion", "mood"],
            MemoryType::Knowledge => &["knowledge", "info"],
            MemoryType::Skill => &["skill", "ability"],
            MemoryType::Goal => &["goal", "plan"],
            MemoryType::Experience => &["experience", "lesson"],
            MemoryType::Contextual => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ImportanceLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl ImportanceLevel {
    pub fn value(self) -> u8 {
        match self {
            ImportanceLevel::Low => 1,
            ImportanceLevel::Normal => 2,
            ImportanceLevel::High => 3,
            ImportanceLevel::Critical => 4,
        }
    }
}

impl From<ImportanceLevel> for u8 {
    fn from(level: ImportanceLevel) -> u8 {
        level.value()
    }
}

impl TryFrom<u8> for ImportanceLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ImportanceLevel::Low),
            2 => Ok(ImportanceLevel::Normal),
            3 => Ok(ImportanceLevel::High),
            4 => Ok(ImportanceLevel::Critical),
            other => Err(format!("importance out of range: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    Verified,
}

impl ConfidenceLevel {
    pub fn value(self) -> u8 {
        match self {
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::Medium => 2,
            ConfidenceLevel::High => 3,
            ConfidenceLevel::Verified => 4,
        }
    }
}

impl From<ConfidenceLevel> for u8 {
    fn from(level: ConfidenceLevel) -> u8 {
        level.value()
    }
}

impl TryFrom<u8> for ConfidenceLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConfidenceLevel::Low),
            2 => Ok(ConfidenceLevel::Medium),
            3 => Ok(ConfidenceLevel::High),
            4 => Ok(ConfidenceLevel::Verified),
            other => Err(format!("confidence out of range: {other}")),
        }
    }
}

/// The object slot of a subject–predicate–object triple: either free
/// text or a structured map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectValue {
    Text(String),
    Structured(serde_json::Map<String, serde_json::Value>),
}

impl ObjectValue {
    /// Deterministic rendering used in fingerprints and hashes.
    /// `serde_json::Map` keeps keys sorted, so the JSON form is stable.
    pub fn canonical(&self) -> String {
        match self {
            ObjectValue::Text(text) => text.trim().to_string(),
            ObjectValue::Structured(map) => {
                serde_json::to_string(map).unwrap_or_default()
            }
        }
    }

    /// Short human rendering for display synthesis.
    pub fn rendered(&self) -> String {
        match self {
            ObjectValue::Text(text) => text.trim().to_string(),
            ObjectValue::Structured(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .filter_map(|(key, value)| match value {
                        serde_json::Value::String(s) => Some(format!("{key}:{s}")),
                        serde_json::Value::Number(n) => Some(format!("{key}:{n}")),
                        serde_json::Value::Array(items) => {
                            let compact: Vec<String> =
                                items.iter().take(3).map(value_to_compact).collect();
                            Some(format!("{key}:{}", compact.join("、")))
                        }
                        _ => None,
                    })
                    .collect();
                if parts.is_empty() {
                    self.canonical()
                } else {
                    parts.join("，")
                }
            }
        }
    }
}

fn value_to_compact(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Subject–predicate–object content plus its natural-language rendering.
/// `display` doubles as the vector-indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContent {
    pub subjects: Vec<String>,
    pub predicate: String,
    pub object: ObjectValue,
    pub display: String,
}

impl MemoryContent {
    pub fn new(subjects: Vec<String>, predicate: impl Into<String>, object: ObjectValue) -> Self {
        let predicate = predicate.into();
        let display = synthesize_display(&subjects, &predicate, &object);
        Self {
            subjects,
            predicate,
            object,
            display,
        }
    }

    pub fn text(&self) -> String {
        if !self.display.is_empty() {
            return self.display.clone();
        }
        synthesize_display(&self.subjects, &self.predicate, &self.object)
    }
}

/// Build a natural-language line from a triple when the extractor did
/// not provide one.
pub fn synthesize_display(subjects: &[String], predicate: &str, object: &ObjectValue) -> String {
    let subject_part = if subjects.is_empty() {
        "对话参与者".to_string()
    } else {
        subjects.join("、")
    };

    let object_part = object.rendered();
    let predicate = predicate.trim();

    if predicate.is_empty() {
        return format!("{subject_part} {object_part}").trim().to_string();
    }
    if object_part.is_empty() {
        return format!("{subject_part}{predicate}");
    }
    format!("{subject_part}{predicate}{object_part}")
}

/// Atomic structured memory unit.
///
/// Created by the extractor; mutated only through fusion merges and the
/// forgetting sweep. Timestamps are epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: Uuid,
    pub user_scope: String,
    pub chat_scope: Option<String>,
    pub content: MemoryContent,
    pub memory_type: MemoryType,
    pub importance: ImportanceLevel,
    pub confidence: ConfidenceLevel,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub related_memories: BTreeSet<Uuid>,
    pub embedding: Option<Vec<f32>>,
    pub semantic_hash: Option<String>,
    pub created_at: f64,
    pub last_accessed: f64,
    pub last_modified: f64,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub source_context: Option<String>,
}

impl MemoryChunk {
    pub fn new(
        content: MemoryContent,
        memory_type: MemoryType,
        importance: ImportanceLevel,
        confidence: ConfidenceLevel,
        created_at: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_scope: GLOBAL_SCOPE.to_string(),
            chat_scope: None,
            content,
            memory_type,
            importance,
            confidence,
            keywords: BTreeSet::new(),
            tags: BTreeSet::new(),
            categories: BTreeSet::new(),
            related_memories: BTreeSet::new(),
            embedding: None,
            semantic_hash: None,
            created_at,
            last_accessed: created_at,
            last_modified: created_at,
            access_count: 0,
            relevance_score: 0.0,
            source_context: None,
        }
    }

    pub fn display(&self) -> &str {
        &self.content.display
    }

    pub fn text_content(&self) -> String {
        self.content.text()
    }

    /// Attach an embedding and refresh the semantic hash.
    pub fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = Some(embedding);
        self.semantic_hash = Some(self.compute_semantic_hash());
    }

    /// 16-hex fingerprint over the triple plus the embedding rounded to
    /// six decimals. Identical hashes mark fusion duplicates.
    pub fn compute_semantic_hash(&self) -> String {
        let content_part = format!(
            "{}:{}:{}",
            self.content.subjects.join("、"),
            self.content.predicate,
            self.content.object.canonical()
        );
        let embedding_part = self
            .embedding
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|v| format!("{:.6}", v))
            .collect::<Vec<_>>()
            .join(",");

        let mut hasher = Sha256::new();
        hasher.update(content_part.as_bytes());
        hasher.update(b"|");
        hasher.update(embedding_part.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    pub fn record_access(&mut self, now: f64) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    /// Fold `other` into this chunk: union the label sets, keep the
    /// stronger importance/confidence/relevance, bump `last_modified`.
    pub fn merge_from(&mut self, other: &MemoryChunk, now: f64) {
        self.keywords.extend(other.keywords.iter().cloned());
        self.tags.extend(other.tags.iter().cloned());
        self.categories.extend(other.categories.iter().cloned());
        self.related_memories.extend(other.related_memories.iter().copied());

        self.importance = self.importance.max(other.importance);
        self.confidence = self.confidence.max(other.confidence);
        if other.relevance_score > self.relevance_score {
            self.relevance_score = other.relevance_score;
        }
        if other.source_context.is_some() {
            self.source_context = other.source_context.clone();
        }
        self.last_modified = now;
    }
}

/// Cosine similarity clamped to `[0, 1]`; zero on mismatch or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
