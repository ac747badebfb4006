//! Per-message interest scoring and reply gating.
//!
//! Score model (weights from config, result clamped to [0, 1]):
//! ```text
//! score = w_match·profile_match + w_mention·mention + w_rel·relationship + w_rec·recency
//! ```
//! `profile_match` is the embedding cosine between the message text and
//! the bot's interest profile; without a profile it falls back to 0.5.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use murmur_config::InterestConfig;
use murmur_llm::EmbeddingProvider;

use crate::message::Message;

/// Relationship score assigned to users we have never interacted with.
const DEFAULT_RELATIONSHIP: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct InterestScore {
    pub message_id: String,
    pub total: f64,
    pub profile_match: f64,
    pub mention: f64,
    pub relationship: f64,
    pub recency: f64,
}

pub struct InterestScorer {
    config: InterestConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    profile_embedding: Mutex<Option<Vec<f32>>>,
    relationships: Mutex<HashMap<String, f64>>,
    no_reply_streak: Mutex<u32>,
}

impl InterestScorer {
    pub fn new(config: InterestConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            embedder,
            profile_embedding: Mutex::new(None),
            relationships: Mutex::new(HashMap::new()),
            no_reply_streak: Mutex::new(0),
        }
    }

    /// Set the bot's interest profile; message match scores are cosine
    /// similarity against this embedding.
    pub async fn set_interest_profile(&self, profile_text: &str) -> Result<()> {
        let embedding = self.embedder.embed(profile_text).await?;
        *self.profile_embedding.lock().await = Some(embedding);
        Ok(())
    }

    pub async fn score_message(&self, message: &Message, now: f64) -> Result<InterestScore> {
        let profile_match = {
            let profile = self.profile_embedding.lock().await;
            match profile.as_deref() {
                Some(profile) => {
                    let embedding = self.embedder.embed(&message.text).await?;
                    cosine(&embedding, profile) as f64
                }
                None => 0.5,
            }
        };

        let mention = if message.is_mention || message.is_private_chat {
            self.config.mention_bonus
        } else {
            0.0
        };
        let relationship = self.relationship(&message.user_id).await;

        let age = (now - message.timestamp).max(0.0);
        let recency = 0.5_f64.powf(age / self.config.recency_half_life_secs);

        let total = (profile_match * self.config.match_weight
            + mention * self.config.mention_weight
            + relationship * self.config.relationship_weight
            + recency * self.config.recency_weight)
            .clamp(0.0, 1.0);

        trace!(
            message = %message.message_id,
            total,
            profile_match,
            mention,
            relationship,
            recency,
            "scored message"
        );
        Ok(InterestScore {
            message_id: message.message_id.clone(),
            total,
            profile_match,
            mention,
            relationship,
            recency,
        })
    }

    pub async fn score_messages(
        &self,
        messages: &[Message],
        now: f64,
    ) -> Result<Vec<InterestScore>> {
        let mut scores = Vec::with_capacity(messages.len());
        for message in messages {
            scores.push(self.score_message(message, now).await?);
        }
        Ok(scores)
    }

    /// The reply threshold after AFC reduction and the consecutive
    /// no-reply ramp. Monotone decreasing in the streak, floored well
    /// above zero so gating never inverts.
    pub async fn effective_reply_threshold(&self, afc_adjustment: f64) -> f64 {
        let streak = *self.no_reply_streak.lock().await;
        let ramp = streak.min(self.config.max_no_reply_count) as f64
            * self.config.no_reply_threshold_step;
        (self.config.reply_threshold - afc_adjustment - ramp).max(0.05)
    }

    /// Reply gate. Past `max_no_reply_count` the next message scoring
    /// at least half the base threshold is forced into a candidate.
    pub async fn should_reply(&self, score: f64, afc_adjustment: f64) -> bool {
        if score >= self.effective_reply_threshold(afc_adjustment).await {
            return true;
        }
        let streak = *self.no_reply_streak.lock().await;
        streak >= self.config.max_no_reply_count && score >= self.config.reply_threshold * 0.5
    }

    /// Bookkeeping after a plan: replies reset the no-reply streak.
    pub async fn record_reply_outcome(&self, replied: bool) {
        let mut streak = self.no_reply_streak.lock().await;
        if replied {
            *streak = 0;
        } else {
            *streak = streak.saturating_add(1);
        }
        debug!(streak = *streak, replied, "reply outcome recorded");
    }

    pub async fn no_reply_streak(&self) -> u32 {
        *self.no_reply_streak.lock().await
    }

    // ── Relationship side-channel ──────────────────────────────────────────

    pub async fn relationship(&self, user_id: &str) -> f64 {
        self.relationships
            .lock()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(DEFAULT_RELATIONSHIP)
    }

    pub async fn adjust_relationship(&self, user_id: &str, delta: f64) {
        let mut relationships = self.relationships.lock().await;
        let entry = relationships
            .entry(user_id.to_string())
            .or_insert(DEFAULT_RELATIONSHIP);
        *entry = (*entry + delta).clamp(0.0, 1.0);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
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

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use crate::message::InboundEnvelope;

    use super::*;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Texts mentioning ramen point one way, everything else the other.
            if text.contains("拉面") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn scorer() -> InterestScorer {
        InterestScorer::new(InterestConfig::default(), Arc::new(FixedEmbedder))
    }

    fn message(id: &str, text: &str, is_mention: bool, timestamp: f64) -> Message {
        Message::from_envelope(InboundEnvelope {
            platform: "test".to_string(),
            stream_id: "s1".to_string(),
            user_id: "u1".to_string(),
            user_display_name: "小明".to_string(),
            message_id: Some(id.to_string()),
            group_id: Some("g1".to_string()),
            group_name: None,
            timestamp,
            text: text.to_string(),
            is_mention,
            reply_to: None,
            additional_meta: None,
        })
    }

    #[tokio::test]
    async fn profile_match_raises_the_score() -> Result<()> {
        let scorer = scorer();
        scorer.set_interest_profile("拉面 美食").await?;

        let on_topic = scorer
            .score_message(&message("m1", "今天吃拉面", false, 100.0), 100.0)
            .await?;
        let off_topic = scorer
            .score_message(&message("m2", "天气如何", false, 100.0), 100.0)
            .await?;
        assert!(on_topic.total > off_topic.total);
        Ok(())
    }

    #[tokio::test]
    async fn mention_bonus_applies_to_mentions_only() -> Result<()> {
        let scorer = scorer();
        let plain = scorer
            .score_message(&message("m1", "hello", false, 100.0), 100.0)
            .await?;
        let mentioned = scorer
            .score_message(&message("m2", "hello", true, 100.0), 100.0)
            .await?;
        assert!(mentioned.total > plain.total);
        Ok(())
    }

    #[tokio::test]
    async fn recency_decays_with_age() -> Result<()> {
        let scorer = scorer();
        let fresh = scorer
            .score_message(&message("m1", "hello", false, 1_000.0), 1_000.0)
            .await?;
        let stale = scorer
            .score_message(&message("m2", "hello", false, 1_000.0), 1_000.0 + 3_600.0)
            .await?;
        assert!(fresh.recency > stale.recency);
        Ok(())
    }

    #[tokio::test]
    async fn afc_adjustment_lowers_the_effective_threshold() {
        let scorer = scorer();
        let base = scorer.effective_reply_threshold(0.0).await;
        let adjusted = scorer.effective_reply_threshold(0.1).await;
        assert!(adjusted < base);
        assert!(scorer.should_reply(base - 0.05, 0.1).await);
    }

    #[tokio::test]
    async fn no_reply_streak_ramps_down_the_threshold_monotonically() {
        let scorer = scorer();
        let mut previous = scorer.effective_reply_threshold(0.0).await;
        for _ in 0..3 {
            scorer.record_reply_outcome(false).await;
            let current = scorer.effective_reply_threshold(0.0).await;
            assert!(current <= previous);
            previous = current;
        }

        scorer.record_reply_outcome(true).await;
        assert_eq!(scorer.no_reply_streak().await, 0);
    }

    #[tokio::test]
    async fn long_streak_forces_a_reply_candidate() {
        let config = InterestConfig::default();
        let scorer = scorer();
        for _ in 0..config.max_no_reply_count {
            scorer.record_reply_outcome(false).await;
        }
        // Half the base threshold is enough once the cap is reached.
        assert!(scorer.should_reply(config.reply_threshold * 0.6, 0.0).await);
    }

    #[tokio::test]
    async fn relationship_updates_are_clamped() {
        let scorer = scorer();
        scorer.adjust_relationship("u1", 2.0).await;
        assert_eq!(scorer.relationship("u1").await, 1.0);
        scorer.adjust_relationship("u1", -5.0).await;
        assert_eq!(scorer.relationship("u1").await, 0.0);
    }
}
