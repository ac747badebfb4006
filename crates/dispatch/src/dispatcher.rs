//! Priority-queue dispatcher: bounded concurrent stream workers with
//! retry/backoff and per-stream serialization.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use murmur_chat::{Clock, EnergyCalculator};
use murmur_config::{EnergyConfig, SchedulingConfig};

use crate::state::StreamDistributionState;
use crate::task::{DispatchPriority, DispatchTask};

/// Tasks older than this are dropped unprocessed.
const MAX_TASK_AGE_SECS: f64 = 3_600.0;
/// Completed/failed history entries older than this are pruned.
const HISTORY_MAX_AGE_SECS: f64 = 24.0 * 3_600.0;

/// What a worker receives when its stream comes up.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub stream_id: String,
    pub energy: f64,
    pub message_count: usize,
}

/// The injected distribution executor. An `Err` counts as a failed
/// distribution and drives the retry path.
#[async_trait]
pub trait DistributionExecutor: Send + Sync {
    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<()>;

    /// Optional priority override consulted before the built-in rules.
    fn priority_override(&self, _stream_id: &str) -> Option<DispatchPriority> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub total_created_tasks: u64,
    pub total_completed_tasks: u64,
    pub total_failed_tasks: u64,
    pub total_retry_attempts: u64,
    pub total_dropped_tasks: u64,
    pub peak_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub processing_count: usize,
    pub max_concurrent: usize,
    pub is_running: bool,
    pub priority_distribution: HashMap<DispatchPriority, usize>,
    pub stats: DispatcherStats,
}

struct Inner {
    config: SchedulingConfig,
    clock: Arc<dyn Clock>,
    energy: EnergyCalculator,
    executor: Arc<dyn DistributionExecutor>,
    queue: Mutex<BinaryHeap<DispatchTask>>,
    states: Mutex<HashMap<String, StreamDistributionState>>,
    in_flight: Mutex<HashSet<String>>,
    exec_handles: Mutex<HashMap<String, JoinHandle<()>>>,
    completed: Mutex<VecDeque<DispatchTask>>,
    failed: Mutex<VecDeque<DispatchTask>>,
    stats: Mutex<DispatcherStats>,
    running: AtomicBool,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: SchedulingConfig,
        energy_config: EnergyConfig,
        executor: Arc<dyn DistributionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            retry_base = config.retry_base_delay_secs,
            "dispatcher created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                energy: EnergyCalculator::new(energy_config),
                executor,
                queue: Mutex::new(BinaryHeap::new()),
                states: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                exec_handles: Mutex::new(HashMap::new()),
                completed: Mutex::new(VecDeque::new()),
                failed: Mutex::new(VecDeque::new()),
                stats: Mutex::new(DispatcherStats::default()),
                running: AtomicBool::new(false),
            }),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register pending work for a stream. Returns `false` when the
    /// queue is full.
    pub async fn enqueue(
        &self,
        stream_id: &str,
        message_count: usize,
        priority: Option<DispatchPriority>,
    ) -> bool {
        let inner = &self.inner;
        {
            let queue = inner.queue.lock().await;
            if queue.len() >= inner.config.max_queue_size {
                warn!(stream = %stream_id, "dispatch queue full, rejecting");
                return false;
            }
        }

        let now = inner.clock.now_secs();
        let task = {
            let mut states = inner.states.lock().await;
            let state = states
                .entry(stream_id.to_string())
                .or_insert_with(|| StreamDistributionState::new(stream_id, now));
            state.message_count += message_count;

            let priority = priority
                .or_else(|| inner.executor.priority_override(stream_id))
                .unwrap_or_else(|| compute_priority(state));
            DispatchTask::new(
                stream_id,
                priority,
                state.energy,
                state.message_count,
                now,
                inner.config.max_retries,
            )
        };

        debug!(stream = %stream_id, priority = ?task.priority, message_count, "task enqueued");
        let mut queue = inner.queue.lock().await;
        queue.push(task);
        let mut stats = inner.stats.lock().await;
        stats.total_created_tasks += 1;
        stats.peak_queue_size = stats.peak_queue_size.max(queue.len());
        true
    }

    pub async fn update_energy(&self, stream_id: &str, energy: f64) {
        if let Some(state) = self.inner.states.lock().await.get_mut(stream_id) {
            state.energy = energy.clamp(0.0, 1.0);
        }
    }

    /// Inject a Critical task, bypassing priority computation.
    pub async fn force_process(&self, stream_id: &str) -> bool {
        let inner = &self.inner;
        let states = inner.states.lock().await;
        let Some(state) = states.get(stream_id) else {
            return false;
        };
        if !state.is_active {
            return false;
        }
        let task = DispatchTask::new(
            stream_id,
            DispatchPriority::Critical,
            state.energy,
            state.message_count,
            inner.clock.now_secs(),
            inner.config.max_retries,
        );
        drop(states);

        info!(stream = %stream_id, "forcing stream processing");
        inner.queue.lock().await.push(task);
        true
    }

    pub async fn start(&self, cleanup_interval: Duration) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already running");
            return;
        }

        let dispatch_inner = self.inner.clone();
        let dispatch_handle = tokio::spawn(async move {
            dispatch_loop(dispatch_inner).await;
        });

        let cleanup_inner = self.inner.clone();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_loop(cleanup_inner, cleanup_interval).await;
        });

        let mut handles = self.loop_handles.lock().await;
        handles.push(dispatch_handle);
        handles.push(cleanup_handle);
        info!("dispatcher started");
    }

    /// Stop the loops and abort every in-flight execution. Cancelled
    /// workers leave their snapshots unread by construction.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for handle in self.loop_handles.lock().await.drain(..) {
            handle.abort();
        }
        let mut exec_handles = self.inner.exec_handles.lock().await;
        for (stream_id, handle) in exec_handles.drain() {
            debug!(stream = %stream_id, "aborting in-flight execution");
            handle.abort();
        }
        self.inner.in_flight.lock().await.clear();
        info!("dispatcher stopped");
    }

    pub async fn is_in_flight(&self, stream_id: &str) -> bool {
        self.inner.in_flight.lock().await.contains(stream_id)
    }

    /// Pre-emptive interruption: abort the stream's in-flight worker.
    /// The aborted worker cannot have promoted its snapshot, so the
    /// messages stay unread. Returns `false` when nothing was running.
    pub async fn interrupt_stream(&self, stream_id: &str) -> bool {
        let Some(handle) = self.inner.exec_handles.lock().await.remove(stream_id) else {
            return false;
        };
        handle.abort();
        self.inner.in_flight.lock().await.remove(stream_id);
        info!(stream = %stream_id, "in-flight worker interrupted");
        true
    }

    /// Let an external cadence owner (the message manager) declare a
    /// stream due now, overriding the energy-derived pacing.
    pub async fn mark_due(&self, stream_id: &str) {
        let now = self.inner.clock.now_secs();
        if let Some(state) = self.inner.states.lock().await.get_mut(stream_id) {
            if state.next_distribution_time > now {
                state.next_distribution_time = now;
            }
        }
    }

    pub async fn deactivate_stream(&self, stream_id: &str) -> bool {
        let mut states = self.inner.states.lock().await;
        let Some(state) = states.get_mut(stream_id) else {
            return false;
        };
        state.is_active = false;
        drop(states);

        if let Some(handle) = self.inner.exec_handles.lock().await.remove(stream_id) {
            handle.abort();
        }
        self.inner.in_flight.lock().await.remove(stream_id);
        info!(stream = %stream_id, "stream deactivated");
        true
    }

    pub async fn activate_stream(&self, stream_id: &str) -> bool {
        let now = self.inner.clock.now_secs();
        let mut states = self.inner.states.lock().await;
        let Some(state) = states.get_mut(stream_id) else {
            return false;
        };
        state.is_active = true;
        state.consecutive_failures = 0;
        state.next_distribution_time = now;
        info!(stream = %stream_id, "stream activated");
        true
    }

    pub async fn stream_state(&self, stream_id: &str) -> Option<StreamDistributionState> {
        self.inner.states.lock().await.get(stream_id).cloned()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let queue = self.inner.queue.lock().await;
        let mut priority_distribution: HashMap<DispatchPriority, usize> = HashMap::new();
        for task in queue.iter() {
            *priority_distribution.entry(task.priority).or_default() += 1;
        }
        QueueStatus {
            queue_size: queue.len(),
            processing_count: self.inner.in_flight.lock().await.len(),
            max_concurrent: self.inner.config.max_concurrent,
            is_running: self.inner.running.load(Ordering::SeqCst),
            priority_distribution,
            stats: self.inner.stats.lock().await.clone(),
        }
    }

    /// Drop distribution state for streams inactive beyond the window
    /// with no pending messages. Returns the number removed.
    pub async fn cleanup_inactive_streams(&self, max_inactive_hours: u64) -> usize {
        let now = self.inner.clock.now_secs();
        let cutoff = max_inactive_hours as f64 * 3_600.0;
        let mut states = self.inner.states.lock().await;
        let before = states.len();
        states.retain(|_, state| {
            state.is_active
                || now - state.last_distribution_time <= cutoff
                || state.message_count > 0
        });
        let removed = before - states.len();
        if removed > 0 {
            info!(removed, "cleaned up inactive stream states");
        }
        removed
    }
}

/// Built-in priority rules, applied when no override is present.
fn compute_priority(state: &StreamDistributionState) -> DispatchPriority {
    if state.consecutive_failures >= 3 {
        return DispatchPriority::Background;
    }
    if state.total_distributions > 50 && state.message_count < 2 {
        return DispatchPriority::Low;
    }
    if state.energy >= 0.8 && state.message_count >= 3 {
        DispatchPriority::Critical
    } else if state.energy >= 0.6 || state.message_count >= 5 {
        DispatchPriority::High
    } else if state.energy >= 0.3 || state.message_count >= 2 {
        DispatchPriority::Normal
    } else {
        DispatchPriority::Low
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        process_queue(&inner).await;

        let backlogged = {
            let queue = inner.queue.lock().await;
            let processing = inner.in_flight.lock().await;
            queue.len() > 10 || !processing.is_empty()
        };
        let pause = if backlogged {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(200)
        };
        tokio::time::sleep(pause).await;
    }
}

async fn process_queue(inner: &Arc<Inner>) {
    loop {
        if inner.in_flight.lock().await.len() >= inner.config.max_concurrent {
            return;
        }
        let Some(task) = inner.queue.lock().await.pop() else {
            return;
        };
        let now = inner.clock.now_secs();

        if !task_is_valid(inner, &task, now).await {
            let mut stats = inner.stats.lock().await;
            stats.total_dropped_tasks += 1;
            drop(stats);
            push_history(&inner.failed, task, inner.config.max_task_history).await;
            continue;
        }

        let context = {
            let mut states = inner.states.lock().await;
            let Some(state) = states.get_mut(&task.stream_id) else {
                continue;
            };
            state.last_distribution_time = now;
            state.next_distribution_time = now + inner.energy.interval_from_energy(state.energy);
            ExecutionContext {
                stream_id: task.stream_id.clone(),
                energy: state.energy,
                message_count: state.message_count,
            }
        };

        inner.in_flight.lock().await.insert(task.stream_id.clone());
        info!(
            stream = %task.stream_id,
            energy = context.energy,
            message_count = context.message_count,
            retry = task.retry_count,
            "dispatching stream task"
        );

        let run_inner = inner.clone();
        let stream_id = task.stream_id.clone();
        let handle = tokio::spawn(async move {
            run_task(run_inner, task, context).await;
        });
        inner.exec_handles.lock().await.insert(stream_id, handle);
    }
}

async fn task_is_valid(inner: &Arc<Inner>, task: &DispatchTask, now: f64) -> bool {
    if inner.in_flight.lock().await.contains(&task.stream_id) {
        debug!(stream = %task.stream_id, "stream already in flight, dropping task");
        return false;
    }
    if now - task.created_at > MAX_TASK_AGE_SECS {
        return false;
    }

    let states = inner.states.lock().await;
    let Some(state) = states.get(&task.stream_id) else {
        return false;
    };
    if !state.is_active {
        return false;
    }
    // A retried task was due when it first dispatched; the backoff
    // delay already paced it.
    if task.retry_count > 0 {
        return state.message_count > 0 || task.message_count > 0;
    }
    state.should_distribute(now)
}

async fn run_task(inner: Arc<Inner>, mut task: DispatchTask, context: ExecutionContext) {
    let started = inner.clock.now_secs();
    let result = inner.executor.execute(context).await;
    let duration = inner.clock.now_secs() - started;

    match result {
        Ok(()) => {
            if let Some(state) = inner.states.lock().await.get_mut(&task.stream_id) {
                state.record_outcome(duration, true);
            }
            let mut stats = inner.stats.lock().await;
            stats.total_completed_tasks += 1;
            drop(stats);
            info!(stream = %task.stream_id, duration, retry = task.retry_count, "distribution succeeded");

            inner.in_flight.lock().await.remove(&task.stream_id);
            inner.exec_handles.lock().await.remove(&task.stream_id);
            push_history(&inner.completed, task, inner.config.max_task_history).await;
        }
        Err(err) => {
            error!(stream = %task.stream_id, %err, "distribution failed");
            if let Some(state) = inner.states.lock().await.get_mut(&task.stream_id) {
                state.record_outcome(duration, false);
            }

            if task.can_retry() {
                let delay = task.retry_delay(inner.config.retry_base_delay_secs);
                task.retry_count += 1;
                task.priority = DispatchPriority::Low;
                {
                    let mut stats = inner.stats.lock().await;
                    stats.total_retry_attempts += 1;
                }
                warn!(
                    stream = %task.stream_id,
                    retry = task.retry_count,
                    max = task.max_retries,
                    delay,
                    "retrying distribution"
                );
                // The stream stays marked in-flight through the backoff
                // so no competing worker can start meanwhile.
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                inner.in_flight.lock().await.remove(&task.stream_id);
                inner.exec_handles.lock().await.remove(&task.stream_id);
                inner.queue.lock().await.push(task);
            } else {
                if let Some(state) = inner.states.lock().await.get_mut(&task.stream_id) {
                    state.is_active = false;
                }
                let mut stats = inner.stats.lock().await;
                stats.total_failed_tasks += 1;
                drop(stats);
                error!(stream = %task.stream_id, retries = task.retry_count, "distribution abandoned, stream deactivated");

                inner.in_flight.lock().await.remove(&task.stream_id);
                inner.exec_handles.lock().await.remove(&task.stream_id);
                push_history(&inner.failed, task, inner.config.max_task_history).await;
            }
        }
    }
}

async fn push_history(
    history: &Mutex<VecDeque<DispatchTask>>,
    task: DispatchTask,
    max_len: usize,
) {
    let mut history = history.lock().await;
    history.push_back(task);
    while history.len() > max_len {
        history.pop_front();
    }
}

async fn cleanup_loop(inner: Arc<Inner>, interval: Duration) {
    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;
        let now = inner.clock.now_secs();
        for history in [&inner.completed, &inner.failed] {
            let mut history = history.lock().await;
            history.retain(|task| now - task.created_at < HISTORY_MAX_AGE_SECS);
        }
        debug!("dispatcher history cleanup finished");
    }
}
