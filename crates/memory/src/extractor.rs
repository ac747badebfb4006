//! Hybrid rule + LLM extraction of structured memories from a
//! conversation window.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use murmur_llm::{GenerateOptions, LlmProvider, RequestKind, json as llm_json};

use crate::chunk::{
    ConfidenceLevel, ImportanceLevel, MemoryChunk, MemoryContent, MemoryType, ObjectValue,
    synthesize_display,
};
use crate::error::MemoryError;
use crate::fusion::content_fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    RuleBased,
    LlmBased,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Normal,
    Command,
    System,
}

/// Everything the extractor knows about the conversation window beyond
/// the raw text.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub stream_id: Option<String>,
    pub user_id: Option<String>,
    pub user_display_name: Option<String>,
    /// Display names of everyone who spoke in the window, bot excluded.
    pub participants: Vec<String>,
    pub message_kind: MessageKind,
    pub keywords: Vec<String>,
    pub has_structured_data: bool,
    /// Epoch seconds the window was captured at.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionStats {
    pub total_runs: u64,
    pub extracted: u64,
    pub failed_runs: u64,
}

/// Raw shape the LLM is asked to produce.
#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    memories: Vec<RawMemory>,
}

#[derive(Debug, Deserialize)]
struct RawMemory {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    subject: Value,
    #[serde(default)]
    predicate: String,
    #[serde(default)]
    object: Value,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    importance: Option<u8>,
    #[serde(default)]
    confidence: Option<u8>,
}

pub struct MemoryExtractor {
    llm: Arc<dyn LlmProvider>,
    bot_name: String,
    bot_aliases: BTreeSet<String>,
    llm_timeout: Duration,
    stats: std::sync::Mutex<ExtractionStats>,
}

impl MemoryExtractor {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        bot_name: impl Into<String>,
        bot_aliases: impl IntoIterator<Item = String>,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            bot_name: bot_name.into(),
            bot_aliases: bot_aliases.into_iter().map(|a| a.to_lowercase()).collect(),
            llm_timeout,
            stats: std::sync::Mutex::new(ExtractionStats::default()),
        }
    }

    pub fn stats(&self) -> ExtractionStats {
        self.stats.lock().expect("stats lock").clone()
    }

    /// Extract structured memories from a conversation window.
    ///
    /// Parse failures surface as [`MemoryError::ExtractionParse`]; the
    /// caller treats them as "no memories this round".
    pub async fn extract(
        &self,
        conversation_text: &str,
        context: &ConversationContext,
    ) -> Result<Vec<MemoryChunk>, MemoryError> {
        let text = preprocess(conversation_text);
        let strategy = choose_strategy(&text, context);
        debug!(?strategy, chars = text.chars().count(), "extracting memories");

        let raw = match strategy {
            ExtractionStrategy::RuleBased => self.extract_with_rules(&text, context),
            ExtractionStrategy::LlmBased => self.extract_with_llm(&text, context).await?,
            ExtractionStrategy::Hybrid => {
                let mut rule_memories = self.extract_with_rules(&text, context);
                let llm_memories = self.extract_with_llm(&text, context).await?;
                merge_hybrid(&mut rule_memories, llm_memories);
                rule_memories
            }
        };

        let validated = self.postprocess(raw, context);

        let mut stats = self.stats.lock().expect("stats lock");
        stats.total_runs += 1;
        stats.extracted += validated.len() as u64;
        if validated.is_empty() {
            debug!("extraction produced no valid memories");
        } else {
            info!(count = validated.len(), "extracted memories");
        }
        Ok(validated)
    }

    // ── Rule extraction ────────────────────────────────────────────────────

    fn extract_with_rules(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Vec<MemoryChunk> {
        let subjects = self.resolve_subjects(context);
        let mut memories = Vec::new();

        for (pattern, predicate, key) in personal_fact_patterns() {
            if let Some(captures) = pattern.captures(text) {
                let value = captures[1].trim().to_string();
                let mut object = serde_json::Map::new();
                object.insert(key.to_string(), Value::String(value));
                memories.push(self.build_chunk(
                    subjects.clone(),
                    predicate,
                    ObjectValue::Structured(object),
                    MemoryType::PersonalFact,
                    ImportanceLevel::High,
                    ConfidenceLevel::High,
                    context,
                ));
            }
        }

        for (pattern, predicate) in preference_patterns() {
            if let Some(captures) = pattern.captures(text) {
                memories.push(self.build_chunk(
                    subjects.clone(),
                    predicate,
                    ObjectValue::Text(captures[1].trim().to_string()),
                    MemoryType::Preference,
                    ImportanceLevel::Normal,
                    ConfidenceLevel::Medium,
                    context,
                ));
            }
        }

        if EVENT_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            let mut object = serde_json::Map::new();
            object.insert("event_text".to_string(), Value::String(text.to_string()));
            memories.push(self.build_chunk(
                subjects,
                "mentioned_event",
                ObjectValue::Structured(object),
                MemoryType::Event,
                ImportanceLevel::Normal,
                ConfidenceLevel::Medium,
                context,
            ));
        }

        memories
    }

    fn build_chunk(
        &self,
        subjects: Vec<String>,
        predicate: &str,
        object: ObjectValue,
        memory_type: MemoryType,
        importance: ImportanceLevel,
        confidence: ConfidenceLevel,
        context: &ConversationContext,
    ) -> MemoryChunk {
        let content = MemoryContent::new(subjects, predicate, object);
        let mut chunk = MemoryChunk::new(content, memory_type, importance, confidence, context.timestamp);
        chunk.chat_scope = context.stream_id.clone();
        chunk
    }

    // ── LLM extraction ─────────────────────────────────────────────────────

    async fn extract_with_llm(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Result<Vec<MemoryChunk>, MemoryError> {
        let prompt = self.build_extraction_prompt(text, context);
        let options = GenerateOptions::constrained(RequestKind::MemoryExtraction);

        let response = tokio::time::timeout(self.llm_timeout, self.llm.generate(&prompt, &options))
            .await
            .map_err(|_| MemoryError::ExtractionParse("extraction call timed out".into()))?
            .map_err(|err| MemoryError::ExtractionParse(err.to_string()))?;

        let parsed: RawExtraction = llm_json::parse_lenient(&response).ok_or_else(|| {
            let preview: String = response.chars().take(120).collect();
            MemoryError::ExtractionParse(format!("unparseable response: {preview}"))
        })?;

        let mut memories = Vec::new();
        for raw in parsed.memories {
            let Some(chunk) = self.raw_to_chunk(raw, context) else {
                continue;
            };
            memories.push(chunk);
        }
        Ok(memories)
    }

    fn build_extraction_prompt(&self, text: &str, context: &ConversationContext) -> String {
        let now = format_datetime(context.timestamp);
        let user = context
            .user_display_name
            .clone()
            .or_else(|| context.user_id.clone())
            .unwrap_or_else(|| "对话参与者".to_string());

        let mut prompt = String::new();
        prompt.push_str(&format!("当前时间：{now}\n"));
        prompt.push_str(&format!(
            "你是{}。注意：关于你自己（{}）的信息不需要记忆。\n\n",
            self.bot_name, self.bot_name
        ));
        prompt.push_str(&format!("请从以下与 {user} 的对话中提取值得长期记忆的结构化信息。\n\n"));
        prompt.push_str("对话内容：\n");
        prompt.push_str(text);
        prompt.push_str("\n\n请以JSON输出，格式如下：\n");
        prompt.push_str(
            r#"{
  "memories": [
    {
      "type": "personal_fact|event|preference|opinion|relationship|emotion|knowledge|skill|goal|experience|contextual",
      "display": "一句自然语言描述",
      "subject": ["主语"],
      "predicate": "谓语",
      "object": "宾语（字符串或结构化对象）",
      "keywords": ["关键词"],
      "importance": 1,
      "confidence": 2,
      "reasoning": "提取理由"
    }
  ]
}
"#,
        );
        prompt.push_str("importance与confidence取1-4。没有值得记忆的内容时输出 {\"memories\": []}。\n");
        prompt
    }

    fn raw_to_chunk(&self, raw: RawMemory, context: &ConversationContext) -> Option<MemoryChunk> {
        let memory_type = MemoryType::from_slug(raw.kind.trim()).unwrap_or(MemoryType::Contextual);

        let mut raw_subjects = Vec::new();
        match &raw.subject {
            Value::String(s) => raw_subjects.push(s.clone()),
            Value::Array(items) => {
                raw_subjects.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
            }
            _ => {}
        }
        // No subject slot at all → attribute to the conversation
        // participants. Subjects that all normalized away (bot, system
        // ids) mean the memory is not about a person we track: drop it.
        let subjects = if raw_subjects.is_empty() {
            self.resolve_subjects(context)
        } else {
            self.normalize_subject_list(raw_subjects)
        };
        if subjects.is_empty() {
            debug!("dropping extracted memory without usable subjects");
            return None;
        }

        let object = match raw.object {
            Value::Object(map) => ObjectValue::Structured(map),
            Value::String(s) => ObjectValue::Text(s),
            Value::Null => ObjectValue::Text(String::new()),
            other => ObjectValue::Text(other.to_string()),
        };

        let importance = raw
            .importance
            .and_then(|v| ImportanceLevel::try_from(v).ok())
            .unwrap_or(ImportanceLevel::Normal);
        let confidence = raw
            .confidence
            .and_then(|v| ConfidenceLevel::try_from(v).ok())
            .unwrap_or(ConfidenceLevel::Medium);

        let display = raw
            .display
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| synthesize_display(&subjects, &raw.predicate, &object));

        let content = MemoryContent {
            subjects,
            predicate: raw.predicate.trim().to_string(),
            object,
            display,
        };
        let mut chunk = MemoryChunk::new(
            content,
            memory_type,
            importance,
            confidence,
            context.timestamp,
        );
        chunk.chat_scope = context.stream_id.clone();
        chunk
            .keywords
            .extend(raw.keywords.into_iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()));
        Some(chunk)
    }

    // ── Subject handling ───────────────────────────────────────────────────

    fn resolve_subjects(&self, context: &ConversationContext) -> Vec<String> {
        let mut subjects = self.normalize_subject_list(context.participants.clone());
        if subjects.is_empty() {
            if let Some(user) = context
                .user_display_name
                .clone()
                .or_else(|| context.user_id.clone())
            {
                subjects = self.normalize_subject_list(vec![user]);
            }
        }
        subjects
    }

    fn normalize_subject_list(&self, raw: Vec<String>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut subjects = Vec::new();
        for value in raw {
            let normalized = normalize_subject(&value);
            if normalized.is_empty() || looks_like_system_identifier(&normalized) {
                continue;
            }
            // Bot aliases resolve to the bot itself, which is never a
            // memory subject.
            let lowered = normalized.to_lowercase();
            if lowered == self.bot_name.to_lowercase() || self.bot_aliases.contains(&lowered) {
                continue;
            }
            if seen.insert(normalized.clone()) {
                subjects.push(normalized);
            }
        }
        subjects
    }

    // ── Post-processing ────────────────────────────────────────────────────

    fn postprocess(
        &self,
        memories: Vec<MemoryChunk>,
        context: &ConversationContext,
    ) -> Vec<MemoryChunk> {
        let mut validated = Vec::new();
        for mut chunk in memories {
            normalize_relative_times(&mut chunk);
            for tag in chunk.memory_type.auto_tags() {
                chunk.tags.insert((*tag).to_string());
            }
            for keyword in &context.keywords {
                let trimmed = keyword.trim();
                if !trimmed.is_empty() {
                    chunk.keywords.insert(trimmed.to_string());
                }
            }

            if let Err(reason) = validate(&chunk) {
                debug!(%reason, "dropping invalid memory chunk");
                continue;
            }
            validated.push(chunk);
        }
        validated
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────────

fn preprocess(text: &str) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > 2000 {
        let truncated: String = collapsed.chars().take(2000).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}

pub fn choose_strategy(text: &str, context: &ConversationContext) -> ExtractionStrategy {
    if text.chars().count() < 50 {
        return ExtractionStrategy::RuleBased;
    }
    if matches!(context.message_kind, MessageKind::Command | MessageKind::System) {
        return ExtractionStrategy::RuleBased;
    }
    if context.has_structured_data || !context.keywords.is_empty() {
        return ExtractionStrategy::Hybrid;
    }
    ExtractionStrategy::LlmBased
}

/// Trim, strip decorative quoting, and collapse inner whitespace.
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize_subject(raw: &str) -> String {
    let stripped: &str = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '@' | '「' | '」' | '《' | '》' | '[' | ']' | '（' | '）' | '(' | ')'));
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Long hex blobs, UUID-ish strings, and numeric ids are machine
/// artifacts, never conversation subjects.
pub fn looks_like_system_identifier(value: &str) -> bool {
    let compact: String = value.chars().filter(|c| *c != '-').collect();
    if compact.len() >= 12 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    let digits = value.chars().filter(char::is_ascii_digit).count();
    digits >= 8 && digits * 2 >= value.chars().count()
}

fn validate(chunk: &MemoryChunk) -> Result<(), String> {
    if chunk.content.subjects.is_empty() {
        return Err("empty subjects".into());
    }
    if chunk.content.predicate.trim().is_empty() {
        return Err("empty predicate".into());
    }
    let length = chunk.text_content().chars().count();
    if !(5..=500).contains(&length) {
        return Err(format!("content length out of range: {length}"));
    }
    if chunk.confidence == ConfidenceLevel::Low {
        return Err("confidence too low".into());
    }
    Ok(())
}

fn merge_hybrid(rule_memories: &mut Vec<MemoryChunk>, llm_memories: Vec<MemoryChunk>) {
    let known: BTreeSet<String> = rule_memories.iter().map(content_fingerprint).collect();
    for memory in llm_memories {
        if known.contains(&content_fingerprint(&memory)) {
            // Same triple from both strategies: keep the rule copy but
            // honor the stronger confidence.
            if let Some(existing) = rule_memories
                .iter_mut()
                .find(|m| content_fingerprint(m) == content_fingerprint(&memory))
            {
                existing.confidence = existing.confidence.max(memory.confidence);
            }
            continue;
        }
        rule_memories.push(memory);
    }
}

fn format_datetime(timestamp: f64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

// ── Rule pattern tables ───────────────────────────────────────────────────────

const EVENT_KEYWORDS: &[&str] = &[
    "明天", "今天", "昨天", "上周", "下周", "约会", "会议", "活动", "旅行", "生日",
    "tomorrow", "meeting", "birthday", "trip", "appointment",
];

fn personal_fact_patterns() -> &'static [(Regex, &'static str, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"我叫([\w\p{Han}]+)", "is_named", "name"),
            (r"(?i)my name is (\w+)", "is_named", "name"),
            (r"我今年(\d+)岁", "is_age", "age"),
            (r"(?i)i am (\d+) years old", "is_age", "age"),
            (r"我是([\w\p{Han}]+)", "is_profession", "profession"),
            (r"我住在([\w\p{Han}]+)", "lives_in", "location"),
            (r"(?i)i live in ([\w ]+)", "lives_in", "location"),
            (r"我的电话是(\d+)", "has_phone", "phone"),
            (r"我的邮箱是([\w.]+@[\w.]+)", "has_email", "email"),
        ]
        .into_iter()
        .map(|(pattern, predicate, key)| {
            (Regex::new(pattern).expect("static pattern"), predicate, key)
        })
        .collect()
    })
}

fn preference_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"我不喜欢(.+)", "dislikes"),
            (r"我喜欢(.+)", "likes"),
            (r"我爱吃(.+)", "likes_food"),
            (r"我讨厌(.+)", "hates"),
            (r"我最喜欢的(.+)", "favorite_is"),
            (r"(?i)i (?:really )?like (.+)", "likes"),
            (r"(?i)i hate (.+)", "hates"),
        ]
        .into_iter()
        .map(|(pattern, predicate)| (Regex::new(pattern).expect("static pattern"), predicate))
        .collect()
    })
}

// ── Relative-time normalization ───────────────────────────────────────────────

/// Replace relative time expressions in the triple with absolute dates
/// anchored at the chunk's creation time.
pub fn normalize_relative_times(chunk: &mut MemoryChunk) {
    let Some(base) = DateTime::<Utc>::from_timestamp(chunk.created_at as i64, 0) else {
        return;
    };
    let table = relative_time_table(base);

    let rewrite = |value: &str| -> String {
        let mut out = value.to_string();
        for (pattern, replacement) in &table {
            out = pattern.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    };

    for subject in &mut chunk.content.subjects {
        *subject = rewrite(subject);
    }
    chunk.content.predicate = rewrite(&chunk.content.predicate);
    chunk.content.object = rewrite_object(&chunk.content.object, &rewrite);
    chunk.content.display = rewrite(&chunk.content.display);
}

fn rewrite_object(object: &ObjectValue, rewrite: &dyn Fn(&str) -> String) -> ObjectValue {
    match object {
        ObjectValue::Text(text) => ObjectValue::Text(rewrite(text)),
        ObjectValue::Structured(map) => {
            let rewritten = map
                .iter()
                .map(|(key, value)| (key.clone(), rewrite_value(value, rewrite)))
                .collect();
            ObjectValue::Structured(rewritten)
        }
    }
}

fn rewrite_value(value: &Value, rewrite: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(rewrite(s)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| rewrite_value(v, rewrite)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, rewrite)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn relative_time_table(base: DateTime<Utc>) -> Vec<(Regex, String)> {
    let day = chrono::Duration::days(1);
    let week = chrono::Duration::weeks(1);
    let date = |d: DateTime<Utc>| d.format("%Y-%m-%d").to_string();
    let month_start = |d: DateTime<Utc>| d.format("%Y-%m-01").to_string();
    let prev_month = base.with_day(1).unwrap_or(base) - day;
    let next_month = (base.with_day(1).unwrap_or(base) + chrono::Duration::days(32))
        .with_day(1)
        .unwrap_or(base);

    // Longer expressions first so 大后天 never partially matches as 后天.
    [
        (r"大后天", date(base + day * 3)),
        (r"大前天", date(base - day * 3)),
        (r"后天", date(base + day * 2)),
        (r"前天", date(base - day * 2)),
        (r"今天|今日|(?i)\btoday\b", date(base)),
        (r"昨天|昨日|(?i)\byesterday\b", date(base - day)),
        (r"明天|明日|(?i)\btomorrow\b", date(base + day)),
        (r"本周|这周|这星期|(?i)\bthis week\b", date(base)),
        (r"上周|上星期|(?i)\blast week\b", date(base - week)),
        (r"下周|下星期|(?i)\bnext week\b", date(base + week)),
        (r"本月|这个月|(?i)\bthis month\b", month_start(base)),
        (r"上月|上个月|(?i)\blast month\b", month_start(prev_month)),
        (r"下月|下个月|(?i)\bnext month\b", month_start(next_month)),
        (r"今年|(?i)\bthis year\b", base.format("%Y").to_string()),
        (r"去年|(?i)\blast year\b", (base.year() - 1).to_string()),
        (r"明年|(?i)\bnext year\b", (base.year() + 1).to_string()),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("static pattern"), replacement))
    .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use murmur_llm::{GenerateOptions, LlmProvider};

    use crate::chunk::{ConfidenceLevel, MemoryType, ObjectValue};

    use super::*;

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
            Ok(self.response.clone())
        }
    }

    fn extractor(response: &str) -> MemoryExtractor {
        MemoryExtractor::new(
            Arc::new(ScriptedLlm {
                response: response.to_string(),
            }),
            "Murmur",
            vec!["小莫".to_string()],
            Duration::from_secs(5),
        )
    }

    fn context() -> ConversationContext {
        ConversationContext {
            stream_id: Some("s1".to_string()),
            user_id: Some("u1".to_string()),
            user_display_name: Some("小明".to_string()),
            participants: vec!["小明".to_string()],
            timestamp: 1_700_000_000.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn short_text_takes_the_rule_path() -> Result<()> {
        // The scripted LLM would return garbage; rule-only must not call it.
        let extractor = extractor("not json");
        let memories = extractor.extract("我叫小明", &context()).await?;
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].memory_type, MemoryType::PersonalFact);
        assert_eq!(memories[0].content.predicate, "is_named");
        Ok(())
    }

    #[tokio::test]
    async fn rule_path_extracts_preferences() -> Result<()> {
        let extractor = extractor("unused");
        let memories = extractor.extract("我喜欢拉面", &context()).await?;
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].memory_type, MemoryType::Preference);
        match &memories[0].content.object {
            ObjectValue::Text(text) => assert_eq!(text, "拉面"),
            other => panic!("expected text object, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn llm_path_parses_fenced_json() -> Result<()> {
        let response = r#"```json
{"memories": [{"type": "personal_fact", "display": "小明居住在北京",
  "subject": ["小明"], "predicate": "lives_in", "object": {"location": "北京"},
  "keywords": ["北京"], "importance": 3, "confidence": 3}]}
```"#;
        let extractor = extractor(response);
        let long_text = "我们在群里聊了很久，小明说他最近刚刚搬了新家，现在住在北京市海淀区的一个小区里，通勤比以前方便了不少，周末还打算请大家去他家附近吃饭。";
        let memories = extractor.extract(long_text, &context()).await?;
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].display(), "小明居住在北京");
        assert!(memories[0].keywords.contains("北京"));
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_llm_response_is_a_typed_error() {
        let extractor = extractor("I could not produce JSON, sorry.");
        let long_text = "a".repeat(120);
        let err = extractor.extract(&long_text, &context()).await.unwrap_err();
        assert!(matches!(err, MemoryError::ExtractionParse(_)));
    }

    #[tokio::test]
    async fn bot_subjects_are_rejected() -> Result<()> {
        let response = r#"{"memories": [{"type": "contextual", "subject": ["小莫"],
  "predicate": "said", "object": "hello", "confidence": 2}]}"#;
        let extractor = extractor(response);
        let long_text = "聊天记录：大家一直在和小莫打招呼，聊的内容全都是关于机器人自己的话题，比如它的名字和它会做什么，这里没有任何别的参与者的个人信息可以记。";
        let memories = extractor.extract(&long_text, &context()).await?;
        assert!(memories.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn low_confidence_memories_are_dropped() -> Result<()> {
        let response = r#"{"memories": [{"type": "opinion", "subject": ["小明"],
  "predicate": "thinks", "object": "天气不错而且适合出门散步", "confidence": 1}]}"#;
        let extractor = extractor(response);
        let long_text = "b".repeat(80);
        let memories = extractor.extract(&long_text, &context()).await?;
        assert!(memories.is_empty());
        Ok(())
    }

    #[test]
    fn normalize_subject_is_idempotent() {
        for raw in ["  「小明」 ", "@alice", "\"bob\"", "plain"] {
            let once = normalize_subject(raw);
            assert_eq!(normalize_subject(&once), once);
        }
    }

    #[test]
    fn system_identifiers_are_detected() {
        assert!(looks_like_system_identifier("a1b2c3d4e5f60718"));
        assert!(looks_like_system_identifier("123456789"));
        assert!(!looks_like_system_identifier("小明"));
        assert!(!looks_like_system_identifier("alice"));
    }

    #[test]
    fn relative_times_become_absolute_dates() {
        let content = crate::chunk::MemoryContent::new(
            vec!["小明".to_string()],
            "计划",
            ObjectValue::Text("明天去上海，下周回来".to_string()),
        );
        // 2023-11-14 22:13:20 UTC
        let mut chunk = crate::chunk::MemoryChunk::new(
            content,
            MemoryType::Event,
            crate::chunk::ImportanceLevel::Normal,
            ConfidenceLevel::Medium,
            1_700_000_000.0,
        );
        normalize_relative_times(&mut chunk);
        match &chunk.content.object {
            ObjectValue::Text(text) => {
                assert!(text.contains("2023-11-15"), "got: {text}");
                assert!(text.contains("2023-11-21"), "got: {text}");
            }
            other => panic!("unexpected object {other:?}"),
        }
    }

    #[test]
    fn day_after_tomorrow_outranks_tomorrow_in_rewrites() {
        let content = crate::chunk::MemoryContent::new(
            vec!["小明".to_string()],
            "计划",
            ObjectValue::Text("大后天考试".to_string()),
        );
        let mut chunk = crate::chunk::MemoryChunk::new(
            content,
            MemoryType::Event,
            crate::chunk::ImportanceLevel::Normal,
            ConfidenceLevel::Medium,
            1_700_000_000.0,
        );
        normalize_relative_times(&mut chunk);
        match &chunk.content.object {
            ObjectValue::Text(text) => assert!(text.starts_with("2023-11-17"), "got: {text}"),
            other => panic!("unexpected object {other:?}"),
        }
    }
}
