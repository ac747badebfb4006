//! Ingestion entry point and the per-stream cadence loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Timelike;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use murmur_chat::{
    Clock, ContextStore, EnergyCalculator, EnergyInputs, InboundEnvelope, InterestScorer, Message,
    SleepManager, StreamContext,
};
use murmur_config::CoreConfig;
use murmur_dispatch::Dispatcher;

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub total_ingested: u64,
    pub total_cycles: u64,
    pub total_interruptions: u64,
}

pub struct MessageManager {
    config: Arc<CoreConfig>,
    contexts: Arc<ContextStore>,
    dispatcher: Arc<Dispatcher>,
    sleep: Arc<SleepManager>,
    interest: Arc<InterestScorer>,
    energy: EnergyCalculator,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    ingested: AtomicU64,
    cycles: AtomicU64,
    interruptions: AtomicU64,
}

impl MessageManager {
    pub fn new(
        config: Arc<CoreConfig>,
        contexts: Arc<ContextStore>,
        dispatcher: Arc<Dispatcher>,
        sleep: Arc<SleepManager>,
        interest: Arc<InterestScorer>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            energy: EnergyCalculator::new(config.energy.clone()),
            config,
            contexts,
            dispatcher,
            sleep,
            interest,
            clock,
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            ingested: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
        })
    }

    /// Synchronous ingestion: append to the stream's unread and notify
    /// the dispatcher of pending work at default priority.
    pub async fn ingest(&self, envelope: InboundEnvelope) {
        let message = Message::from_envelope(envelope);
        let stream_id = message.stream_id.clone();
        let now = self.clock.now_secs();

        let context = self.contexts.get_or_create(&stream_id, now).await;
        {
            let mut context = context.lock().await;
            context.push_unread(message);
        }
        self.ingested.fetch_add(1, Ordering::Relaxed);

        self.dispatcher.enqueue(&stream_id, 1, None).await;
        debug!(stream = %stream_id, "message ingested");
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.manager_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        info!("message manager started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
        info!("message manager stopped");
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total_ingested: self.ingested.load(Ordering::Relaxed),
            total_cycles: self.cycles.load(Ordering::Relaxed),
            total_interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }

    async fn manager_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            self.sleep.advance(self.clock.now_utc().hour()).await;

            if let Err(err) = self.check_due_streams().await {
                error!(%err, "manager cycle failed");
            }
            self.cycles.fetch_add(1, Ordering::Relaxed);

            let delay = self.next_cycle_delay().await;
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    /// One cadence cycle: every active stream past its due time gets a
    /// fresh interval, an energy refresh, an interruption check, and a
    /// dispatch notification.
    pub async fn check_due_streams(&self) -> anyhow::Result<()> {
        let now = self.clock.now_secs();

        for (stream_id, context_arc) in self.contexts.all().await {
            let energy = self
                .dispatcher
                .stream_state(&stream_id)
                .await
                .map(|state| state.energy)
                .unwrap_or(0.5);

            let unread_count = {
                let mut context = context_arc.lock().await;
                if !context.is_active {
                    continue;
                }
                if now < context.next_check_time {
                    continue;
                }
                context.last_check_time = now;
                let interval = self.distribution_interval(&context, energy);
                context.distribution_interval = interval;
                context.next_check_time = now + interval;
                context.unread_count()
            };
            if unread_count == 0 {
                continue;
            }

            self.maybe_interrupt(&stream_id, &context_arc, now).await;
            self.refresh_energy(&stream_id, &context_arc, now).await;

            self.dispatcher.mark_due(&stream_id).await;
            self.dispatcher.enqueue(&stream_id, unread_count, None).await;
        }
        Ok(())
    }

    /// The threshold-aware dynamic distribution interval.
    fn distribution_interval(&self, context: &StreamContext, focus_energy: f64) -> f64 {
        let scheduling = &self.config.scheduling;
        if !scheduling.dynamic_distribution {
            return scheduling.check_interval_secs;
        }

        let interest_cfg = &self.config.interest;
        let avg_interest = context.average_unread_interest();

        let reply = interest_cfg.reply_threshold;
        let non_reply = interest_cfg.non_reply_action_threshold;
        let high = interest_cfg.high_match_threshold;

        let multiplier = if avg_interest >= high {
            (0.3 + (focus_energy - 0.7) * 2.0).max(0.0)
        } else if avg_interest >= reply {
            let gap = (avg_interest - reply) / (high - reply);
            0.6 + gap * 0.4
        } else if avg_interest >= non_reply {
            let gap = (avg_interest - non_reply) / (reply - non_reply);
            1.2 + gap * 1.8
        } else {
            let gap = (avg_interest / non_reply).max(0.0);
            3.0 + (1.0 - gap) * 3.0
        };

        let energy_adjustment = 1.0 + (focus_energy - 0.5) * 0.5;
        let jitter = rand::thread_rng()
            .gen_range((1.0 - scheduling.jitter_factor)..=(1.0 + scheduling.jitter_factor));

        (scheduling.dist_base_secs * multiplier * energy_adjustment * jitter)
            .clamp(scheduling.dist_min_secs, scheduling.dist_max_secs)
    }

    async fn maybe_interrupt(
        &self,
        stream_id: &str,
        context_arc: &Arc<Mutex<StreamContext>>,
        now: f64,
    ) {
        let interruption = &self.config.interruption;
        if !interruption.enabled {
            return;
        }
        if !self.dispatcher.is_in_flight(stream_id).await {
            return;
        }

        let probability = {
            let context = context_arc.lock().await;
            if context.interruption_count >= interruption.max_limit {
                debug!(
                    stream = %stream_id,
                    count = context.interruption_count,
                    "interruption limit reached, not interrupting"
                );
                return;
            }
            context.interruption_probability(interruption.max_limit, interruption.probability_factor)
        };

        let roll: f64 = rand::thread_rng().r#gen();
        if roll >= probability {
            debug!(stream = %stream_id, probability, "interruption not triggered");
            return;
        }

        if self.dispatcher.interrupt_stream(stream_id).await {
            let mut context = context_arc.lock().await;
            context.record_interruption(now, interruption.afc_reduction);
            self.interruptions.fetch_add(1, Ordering::Relaxed);
            info!(
                stream = %stream_id,
                count = context.interruption_count,
                afc = context.afc_threshold_adjustment,
                "interrupted in-flight worker"
            );
        }
    }

    /// Blend activity, interest, recency, and relationship into the
    /// stream's focus energy and push it to the dispatcher.
    async fn refresh_energy(
        &self,
        stream_id: &str,
        context_arc: &Arc<Mutex<StreamContext>>,
        now: f64,
    ) {
        let (unread_count, avg_interest, last_message) = {
            let context = context_arc.lock().await;
            let last = context
                .snapshot_unread()
                .last()
                .map(|m| (m.timestamp, m.user_id.clone()));
            (context.unread_count(), context.average_unread_interest(), last)
        };

        let (recency, relationship) = match last_message {
            Some((timestamp, user_id)) => (
                EnergyCalculator::recency_from_age(now - timestamp),
                self.interest.relationship(&user_id).await,
            ),
            None => (0.0, 0.0),
        };

        let energy = self.energy.energy(EnergyInputs {
            activity: EnergyCalculator::activity_from_count(unread_count),
            avg_interest,
            recency,
            relationship,
        });
        self.dispatcher.update_energy(stream_id, energy).await;
    }

    async fn next_cycle_delay(&self) -> f64 {
        let now = self.clock.now_secs();
        let cap = self.config.scheduling.check_interval_secs;
        let mut min_delay = cap;

        for (_, context) in self.contexts.all().await {
            let context = context.lock().await;
            if !context.is_active {
                continue;
            }
            let until_due = context.next_check_time - now;
            if until_due <= 0.0 {
                return 0.1;
            }
            min_delay = min_delay.min(until_due);
        }
        min_delay.max(0.1)
    }
}
