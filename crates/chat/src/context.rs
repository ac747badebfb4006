//! Per-stream conversation state: the unread/history split, dispatch
//! due times, and interruption accounting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::message::{ChatType, Message};

/// State of one chat stream. A message lives in exactly one of
/// `unread` or `history`; promotion is one-way.
#[derive(Debug)]
pub struct StreamContext {
    pub stream_id: String,
    /// Fixed by the first message and never changed afterwards.
    chat_type: Option<ChatType>,
    unread: Vec<Message>,
    history: Vec<Message>,
    max_history: usize,

    pub is_active: bool,
    pub last_check_time: f64,
    pub next_check_time: f64,
    pub distribution_interval: f64,

    pub interruption_count: u32,
    pub last_interruption_time: f64,
    /// Accumulated downward adjustment of the reply threshold; resets
    /// with the interruption counter.
    pub afc_threshold_adjustment: f64,
}

impl StreamContext {
    pub fn new(stream_id: impl Into<String>, now: f64, max_history: usize) -> Self {
        Self {
            stream_id: stream_id.into(),
            chat_type: None,
            unread: Vec::new(),
            history: Vec::new(),
            max_history,
            is_active: true,
            last_check_time: now,
            next_check_time: now,
            distribution_interval: 5.0,
            interruption_count: 0,
            last_interruption_time: 0.0,
            afc_threshold_adjustment: 0.0,
        }
    }

    pub fn chat_type(&self) -> Option<ChatType> {
        self.chat_type
    }

    pub fn is_private_chat(&self) -> bool {
        self.chat_type == Some(ChatType::Private)
    }

    pub fn push_unread(&mut self, message: Message) {
        if self.chat_type.is_none() {
            self.chat_type = Some(message.chat_type());
        }
        self.unread.push(message);
    }

    pub fn unread_count(&self) -> usize {
        self.unread.len()
    }

    pub fn history_count(&self) -> usize {
        self.history.len()
    }

    /// Clone the current unread messages for a worker. The originals
    /// stay unread until the worker promotes them, so a cancelled
    /// worker leaves no trace.
    pub fn snapshot_unread(&self) -> Vec<Message> {
        self.unread.clone()
    }

    /// Unread messages belonging to one user, for per-user workers.
    pub fn snapshot_unread_for_user(&self, user_id: &str) -> Vec<Message> {
        self.unread
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn recent_history(&self, limit: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }

    /// Move the given messages from unread to history, evicting the
    /// oldest history entries beyond the bound. Messages processed with
    /// a decision carry their interest/action annotations with them.
    pub fn promote_to_history(&mut self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let promoted: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
        self.unread.retain(|m| !promoted.contains(m.message_id.as_str()));
        self.history.extend(messages.iter().cloned());
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }

    /// Annotate a message in place, wherever it currently lives.
    pub fn update_message_info(
        &mut self,
        message_id: &str,
        interest_score: Option<f64>,
        should_reply: Option<bool>,
    ) {
        for message in self.unread.iter_mut().chain(self.history.iter_mut()) {
            if message.message_id == message_id {
                if interest_score.is_some() {
                    message.interest_score = interest_score;
                }
                if should_reply.is_some() {
                    message.should_reply = should_reply;
                }
                break;
            }
        }
    }

    /// Average interest over the unread messages, 0.5 when unknown.
    pub fn average_unread_interest(&self) -> f64 {
        let scores: Vec<f64> = self.unread.iter().filter_map(|m| m.interest_score).collect();
        if scores.is_empty() {
            return 0.5;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    // ── Interruption accounting ────────────────────────────────────────────

    /// Probability of pre-empting the in-flight worker: 0.8 while the
    /// count stays within `probability_factor` of the limit, then an
    /// exponential falloff.
    pub fn interruption_probability(&self, max_limit: u32, probability_factor: f64) -> f64 {
        if max_limit == 0 {
            return 0.0;
        }
        let ratio = self.interruption_count as f64 / max_limit as f64;
        let probability = if ratio > probability_factor {
            0.5_f64.powf(ratio - probability_factor)
        } else {
            0.8
        };
        probability.clamp(0.0, 1.0)
    }

    pub fn record_interruption(&mut self, now: f64, afc_reduction: f64) {
        self.interruption_count += 1;
        self.last_interruption_time = now;
        self.afc_threshold_adjustment += afc_reduction;
        debug!(
            stream = %self.stream_id,
            count = self.interruption_count,
            afc = self.afc_threshold_adjustment,
            "interruption recorded"
        );
    }

    /// Reset on successful batch completion or stream deactivation.
    pub fn reset_interruptions(&mut self) {
        self.interruption_count = 0;
        self.last_interruption_time = 0.0;
        self.afc_threshold_adjustment = 0.0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextStoreStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub total_unread: usize,
}

/// All live stream contexts, one lock per stream.
pub struct ContextStore {
    streams: RwLock<HashMap<String, Arc<Mutex<StreamContext>>>>,
    max_history: usize,
}

impl ContextStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    pub async fn get_or_create(&self, stream_id: &str, now: f64) -> Arc<Mutex<StreamContext>> {
        if let Some(context) = self.streams.read().await.get(stream_id) {
            return context.clone();
        }
        let mut streams = self.streams.write().await;
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(StreamContext::new(stream_id, now, self.max_history)))
            })
            .clone()
    }

    pub async fn get(&self, stream_id: &str) -> Option<Arc<Mutex<StreamContext>>> {
        self.streams.read().await.get(stream_id).cloned()
    }

    pub async fn all(&self) -> Vec<(String, Arc<Mutex<StreamContext>>)> {
        self.streams
            .read()
            .await
            .iter()
            .map(|(id, context)| (id.clone(), context.clone()))
            .collect()
    }

    pub async fn set_active(&self, stream_id: &str, active: bool) -> bool {
        let Some(context) = self.get(stream_id).await else {
            return false;
        };
        let mut context = context.lock().await;
        context.is_active = active;
        if !active {
            context.reset_interruptions();
        }
        true
    }

    /// Drop streams idle for longer than `max_inactive_hours` that hold
    /// no unread messages. Returns the number removed.
    pub async fn cleanup_inactive(&self, now: f64, max_inactive_hours: u64) -> usize {
        let cutoff = max_inactive_hours as f64 * 3_600.0;
        let mut doomed = Vec::new();
        for (stream_id, context) in self.all().await {
            let context = context.lock().await;
            if now - context.last_check_time > cutoff && context.unread_count() == 0 {
                doomed.push(stream_id);
            }
        }

        if doomed.is_empty() {
            return 0;
        }
        let mut streams = self.streams.write().await;
        for stream_id in &doomed {
            streams.remove(stream_id);
            info!(stream = %stream_id, "removed inactive stream context");
        }
        doomed.len()
    }

    pub async fn stats(&self) -> ContextStoreStats {
        let mut stats = ContextStoreStats::default();
        for (_, context) in self.all().await {
            let context = context.lock().await;
            stats.total_streams += 1;
            if context.is_active {
                stats.active_streams += 1;
            }
            stats.total_unread += context.unread_count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use crate::message::InboundEnvelope;

    use super::*;

    fn message(id: &str, user: &str) -> Message {
        Message::from_envelope(InboundEnvelope {
            platform: "test".to_string(),
            stream_id: "s1".to_string(),
            user_id: user.to_string(),
            user_display_name: user.to_string(),
            message_id: Some(id.to_string()),
            group_id: None,
            group_name: None,
            timestamp: 100.0,
            text: format!("message {id}"),
            is_mention: false,
            reply_to: None,
            additional_meta: None,
        })
    }

    #[test]
    fn unread_and_history_stay_disjoint_through_promotion() {
        let mut context = StreamContext::new("s1", 0.0, 100);
        context.push_unread(message("m1", "u1"));
        context.push_unread(message("m2", "u1"));

        let snapshot = context.snapshot_unread();
        context.promote_to_history(&snapshot[..1]);

        assert_eq!(context.unread_count(), 1);
        assert_eq!(context.history_count(), 1);
        let remaining = context.snapshot_unread();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "m2");
    }

    #[test]
    fn snapshot_leaves_messages_unread_until_promoted() {
        let mut context = StreamContext::new("s1", 0.0, 100);
        context.push_unread(message("m1", "u1"));

        // A worker taking a snapshot and being cancelled changes nothing.
        let _snapshot = context.snapshot_unread();
        assert_eq!(context.unread_count(), 1);
        assert_eq!(context.history_count(), 0);
    }

    #[test]
    fn history_is_bounded_by_oldest_first_eviction() {
        let mut context = StreamContext::new("s1", 0.0, 3);
        for i in 0..5 {
            context.push_unread(message(&format!("m{i}"), "u1"));
        }
        let snapshot = context.snapshot_unread();
        context.promote_to_history(&snapshot);

        assert_eq!(context.history_count(), 3);
        assert_eq!(context.recent_history(10)[0].message_id, "m2");
    }

    #[test]
    fn chat_type_is_fixed_by_the_first_message() {
        let mut context = StreamContext::new("s1", 0.0, 100);
        context.push_unread(message("m1", "u1"));
        assert_eq!(context.chat_type(), Some(ChatType::Private));

        let mut group_message = message("m2", "u2");
        group_message.is_private_chat = false;
        context.push_unread(group_message);
        assert_eq!(context.chat_type(), Some(ChatType::Private));
    }

    #[test]
    fn interruption_probability_decays_past_the_factor() {
        let mut context = StreamContext::new("s1", 0.0, 100);
        assert_eq!(context.interruption_probability(3, 0.6), 0.8);

        context.interruption_count = 3;
        let decayed = context.interruption_probability(3, 0.6);
        assert!(decayed < 0.8);
        assert!(decayed > 0.0);

        assert_eq!(context.interruption_probability(0, 0.6), 0.0);
    }

    #[test]
    fn interruption_reset_also_clears_afc_adjustment() {
        let mut context = StreamContext::new("s1", 0.0, 100);
        context.record_interruption(10.0, 0.1);
        context.record_interruption(11.0, 0.1);
        assert_eq!(context.interruption_count, 2);
        assert!((context.afc_threshold_adjustment - 0.2).abs() < 1e-9);

        context.reset_interruptions();
        assert_eq!(context.interruption_count, 0);
        assert_eq!(context.afc_threshold_adjustment, 0.0);
    }

    #[tokio::test]
    async fn cleanup_removes_idle_streams_without_unread() {
        let store = ContextStore::new(100);
        let idle = store.get_or_create("idle", 0.0).await;
        idle.lock().await.last_check_time = 0.0;

        let busy = store.get_or_create("busy", 0.0).await;
        {
            let mut busy = busy.lock().await;
            busy.last_check_time = 0.0;
            busy.push_unread(message("m1", "u1"));
        }

        let removed = store.cleanup_inactive(25.0 * 3_600.0, 24).await;
        assert_eq!(removed, 1);
        assert!(store.get("idle").await.is_none());
        assert!(store.get("busy").await.is_some());
    }
}
