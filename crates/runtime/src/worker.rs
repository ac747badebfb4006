//! The stream worker: everything that happens between "this stream is
//! due" and "these messages are history".
//!
//! One worker run = score interest → retrieve memories → plan →
//! filter → execute → promote → (async) memory ingest. Cancellation at
//! any point leaves the snapshot unread: promotion is the last
//! mutation and memory ingest only starts afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use murmur_chat::{Clock, ContextStore, InterestScorer, Message, SleepManager, StreamContext};
use murmur_config::CoreConfig;
use murmur_dispatch::{DistributionExecutor, ExecutionContext};
use murmur_memory::{ConversationContext, IngestRequest, MemorySystem, RetrieveContext};
use murmur_planner::{
    ActionContext, ActionRegistry, ChatMode, FilterInputs, PlanExecutor, PlanFilter, PlanRequest,
    PlanState, Planner,
};

/// How far back the planner's read-history block reaches.
const READ_HISTORY_LIMIT: usize = 50;
/// Rolling per-stream log of recently executed actions.
const RECENT_ACTION_LIMIT: usize = 5;
/// Relationship credit for a delivered reply.
const REPLY_RELATIONSHIP_DELTA: f64 = 0.02;

pub struct StreamWorker {
    config: Arc<CoreConfig>,
    contexts: Arc<ContextStore>,
    sleep: Arc<SleepManager>,
    interest: Arc<InterestScorer>,
    planner: Planner,
    executor: PlanExecutor,
    registry: Arc<dyn ActionRegistry>,
    memory: Arc<MemorySystem>,
    clock: Arc<dyn Clock>,
    recent_actions: Mutex<HashMap<String, VecDeque<String>>>,
}

impl StreamWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CoreConfig>,
        contexts: Arc<ContextStore>,
        sleep: Arc<SleepManager>,
        interest: Arc<InterestScorer>,
        llm: Arc<dyn murmur_llm::LlmProvider>,
        registry: Arc<dyn ActionRegistry>,
        memory: Arc<MemorySystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let planner = Planner::new(
            llm,
            config.identity.clone(),
            Duration::from_secs(config.memory.llm_timeout_secs),
        );
        Self {
            executor: PlanExecutor::new(registry.clone()),
            planner,
            registry,
            config,
            contexts,
            sleep,
            interest,
            memory,
            clock,
            recent_actions: Mutex::new(HashMap::new()),
        }
    }

    async fn process_stream(&self, stream_id: &str) -> Result<()> {
        let Some(context) = self.contexts.get(stream_id).await else {
            debug!(stream = %stream_id, "no context for dispatched stream");
            return Ok(());
        };

        let snapshot = context.lock().await.snapshot_unread();
        if snapshot.is_empty() {
            return Ok(());
        }

        // Sleep gate: while sleeping, only wake-triggering snapshots
        // are consumed; everything else stays unread.
        if self.sleep.is_sleeping().await {
            let mut woken = false;
            for message in &snapshot {
                if message.is_private_chat || message.is_mention {
                    if self.sleep.add_wake_value(message.is_private_chat, message.is_mention).await
                    {
                        woken = true;
                        break;
                    }
                }
            }
            if !woken {
                debug!(stream = %stream_id, "sleeping and no wake trigger, leaving snapshot unread");
                return Ok(());
            }
            info!(stream = %stream_id, "woken up by this snapshot, continuing");
        }

        if !self.config.concurrency.process_by_user_id {
            return self.process_batch(stream_id, &context, snapshot).await;
        }

        // Per-user mode: one batch per sender, arrival order preserved,
        // at most `per_user_limit` buckets per run; leftovers stay
        // unread for the next cycle.
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<Message>> = HashMap::new();
        for message in snapshot {
            if !buckets.contains_key(&message.user_id) {
                order.push(message.user_id.clone());
            }
            buckets.entry(message.user_id.clone()).or_default().push(message);
        }

        for user_id in order.into_iter().take(self.config.concurrency.per_user_limit) {
            let batch = buckets.remove(&user_id).unwrap_or_default();
            self.process_batch(stream_id, &context, batch).await?;
            self.reply_pause().await;
        }
        Ok(())
    }

    /// Plan and execute one batch of unread messages.
    async fn process_batch(
        &self,
        stream_id: &str,
        context: &Arc<tokio::sync::Mutex<StreamContext>>,
        snapshot: Vec<Message>,
    ) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_secs();

        let (afc_adjustment, is_private, read_history, peer_name) = {
            let context = context.lock().await;
            (
                context.afc_threshold_adjustment,
                context.is_private_chat(),
                context.recent_history(READ_HISTORY_LIMIT).to_vec(),
                context
                    .recent_history(1)
                    .first()
                    .map(|m| m.user_display_name.clone()),
            )
        };

        // Interest scoring, annotated both locally and in the context.
        let scores = self.interest.score_messages(&snapshot, now).await?;
        let mut snapshot = snapshot;
        let mut top_score = 0.0_f64;
        let mut top_user: Option<String> = None;
        {
            let mut context = context.lock().await;
            for (message, score) in snapshot.iter_mut().zip(scores.iter()) {
                let should = self.interest.should_reply(score.total, afc_adjustment).await;
                message.interest_score = Some(score.total);
                message.should_reply = Some(should);
                context.update_message_info(&message.message_id, Some(score.total), Some(should));
                if score.total >= top_score {
                    top_score = score.total;
                    top_user = Some(message.user_id.clone());
                }
            }
        }
        let avg_interest =
            scores.iter().map(|s| s.total).sum::<f64>() / scores.len().max(1) as f64;
        let reply_allowed = self.interest.should_reply(top_score, afc_adjustment).await;

        // Memories for the planner, keyed off the freshest message.
        let query = snapshot.last().map(|m| m.text.clone()).unwrap_or_default();
        let memories = match self
            .memory
            .retrieve(
                &query,
                &RetrieveContext {
                    stream_id: Some(stream_id.to_string()),
                    keywords: Vec::new(),
                },
                0,
            )
            .await
        {
            Ok(found) => found.iter().map(|m| m.text_content()).collect(),
            Err(err) => {
                warn!(%err, "memory retrieval failed, planning without memories");
                Vec::new()
            }
        };

        let request = PlanRequest {
            stream_id: stream_id.to_string(),
            mode: ChatMode::Focus,
            read_history,
            unread: snapshot.clone(),
            memories,
            recent_actions: self.recent_actions_for(stream_id).await,
            available_actions: self.registry.available_actions(),
            mood: None,
            schedule: None,
            is_group_chat: !is_private,
            peer_name,
        };

        let (mut plan, id_map) = self.planner.plan(&request, self.clock.now_utc()).await;
        PlanFilter::filter(
            &mut plan,
            &id_map,
            &FilterInputs {
                avg_interest,
                top_interest: top_score,
                reply_allowed,
                non_reply_action_threshold: self.config.interest.non_reply_action_threshold,
                interest_gating: true,
            },
        );

        let action_context = ActionContext {
            stream_id: stream_id.to_string(),
            now,
        };
        let had_reply_decision = plan.has_reply_decision();
        let report = self.executor.execute(&mut plan, &action_context).await;
        self.interest.record_reply_outcome(had_reply_decision).await;
        self.remember_actions(stream_id, &plan).await;

        // Promotion rules: a delivered action consumes the snapshot; a
        // pure no-op batch consumes it only when configured to; a
        // failed execution leaves everything unread for the next cycle.
        let all_noop = plan
            .decided_actions
            .iter()
            .all(|d| d.action_type.is_noop());
        let consumed = report.successful_count() > 0
            || (all_noop && self.config.concurrency.promote_unactioned);

        if plan.state == PlanState::Failed {
            bail!("plan execution failed for stream {stream_id}");
        }

        if consumed {
            for message in snapshot.iter_mut() {
                for result in &report.results {
                    if result.success {
                        message.record_action(result.action_type.name());
                    }
                }
            }
            let mut context = context.lock().await;
            context.promote_to_history(&snapshot);
            if report.reply_succeeded {
                context.reset_interruptions();
            }
        }

        if report.reply_succeeded {
            if let Some(user_id) = &top_user {
                self.interest
                    .adjust_relationship(user_id, REPLY_RELATIONSHIP_DELTA)
                    .await;
            }
            self.spawn_memory_ingest(stream_id, context).await;
        }

        Ok(())
    }

    /// Short randomized pause between per-user batches so replies do
    /// not land as a burst.
    async fn reply_pause(&self) {
        let concurrency = &self.config.concurrency;
        let delay = rand::Rng::gen_range(
            &mut rand::thread_rng(),
            concurrency.reply_delay_min_secs..=concurrency.reply_delay_max_secs,
        );
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    async fn recent_actions_for(&self, stream_id: &str) -> Vec<String> {
        self.recent_actions
            .lock()
            .await
            .get(stream_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn remember_actions(&self, stream_id: &str, plan: &murmur_planner::Plan) {
        let mut logs = self.recent_actions.lock().await;
        let log = logs.entry(stream_id.to_string()).or_default();
        for decision in &plan.decided_actions {
            log.push_back(decision.action_type.name().to_string());
            while log.len() > RECENT_ACTION_LIMIT {
                log.pop_front();
            }
        }
    }

    /// Fire-and-forget memory ingestion over the stream's history
    /// window. Runs after promotion so a cancelled worker never gets
    /// here.
    async fn spawn_memory_ingest(
        &self,
        stream_id: &str,
        context: &Arc<tokio::sync::Mutex<StreamContext>>,
    ) {
        let (history_lines, participants, last_user) = {
            let context = context.lock().await;
            let recent = context.recent_history(self.config.memory.history_limit);
            let lines: Vec<String> = recent
                .iter()
                .map(|m| format!("{}: {}", m.user_display_name, m.text))
                .collect();
            let mut participants: Vec<String> = Vec::new();
            for message in recent {
                if !participants.contains(&message.user_display_name) {
                    participants.push(message.user_display_name.clone());
                }
            }
            let last_user = recent
                .last()
                .map(|m| (m.user_id.clone(), m.user_display_name.clone()));
            (lines, participants, last_user)
        };
        if history_lines.is_empty() {
            return;
        }

        let request = IngestRequest {
            fallback_text: history_lines.join("\n"),
            history_lines,
            context: ConversationContext {
                stream_id: Some(stream_id.to_string()),
                user_id: last_user.as_ref().map(|(id, _)| id.clone()),
                user_display_name: last_user.map(|(_, name)| name),
                participants,
                timestamp: self.clock.now_secs(),
                ..Default::default()
            },
        };

        let memory = self.memory.clone();
        let stream = stream_id.to_string();
        tokio::spawn(async move {
            match memory.ingest_conversation(request).await {
                Ok(produced) => {
                    debug!(stream = %stream, produced = produced.len(), "background memory ingest done")
                }
                Err(err) => warn!(stream = %stream, %err, "background memory ingest failed"),
            }
        });
    }
}

#[async_trait]
impl DistributionExecutor for StreamWorker {
    async fn execute(&self, context: ExecutionContext) -> Result<()> {
        self.process_stream(&context.stream_id).await
    }
}
