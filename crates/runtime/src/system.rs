//! Process-wide wiring. All singletons live inside [`SystemContext`],
//! created once at boot and torn down at shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use murmur_chat::{Clock, ContextStore, InterestScorer, SleepManager, SystemClock};
use murmur_config::CoreConfig;
use murmur_dispatch::Dispatcher;
use murmur_llm::{EmbeddingProvider, LlmProvider};
use murmur_memory::{MemoryForgetter, MemorySystem, VectorStore};
use murmur_planner::ActionRegistry;

use crate::manager::MessageManager;
use crate::worker::StreamWorker;

/// Bound on history retained per stream context.
const MAX_HISTORY_PER_STREAM: usize = 100;

/// Injected collaborators the core cannot provide itself.
pub struct Collaborators {
    pub llm: Arc<dyn LlmProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorStore>,
    pub registry: Arc<dyn ActionRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn with_system_clock(
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        registry: Arc<dyn ActionRegistry>,
    ) -> Self {
        Self {
            llm,
            embedder,
            vectors,
            registry,
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct SystemContext {
    pub config: Arc<CoreConfig>,
    pub contexts: Arc<ContextStore>,
    pub sleep: Arc<SleepManager>,
    pub interest: Arc<InterestScorer>,
    pub memory: Arc<MemorySystem>,
    pub dispatcher: Arc<Dispatcher>,
    pub manager: Arc<MessageManager>,
    clock: Arc<dyn Clock>,
    forgetter: Arc<MemoryForgetter>,
    maintenance_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SystemContext {
    /// Build and initialize the whole core. Fails fast on collaborator
    /// misconfiguration (unreachable store, embedding dimension
    /// mismatch).
    pub async fn initialize(config: CoreConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let clock = collaborators.clock.clone();

        let memory = Arc::new(MemorySystem::new(
            config.memory.clone(),
            collaborators.llm.clone(),
            collaborators.embedder.clone(),
            collaborators.vectors.clone(),
            config.identity.bot_name.clone(),
            config.identity.alias_names.clone(),
        ));
        memory
            .initialize()
            .await
            .context("initializing memory system")?;
        let forgetter = Arc::new(MemoryForgetter::new(
            config.memory.clone(),
            memory.store().clone(),
        ));

        let contexts = Arc::new(ContextStore::new(MAX_HISTORY_PER_STREAM));
        let sleep = Arc::new(SleepManager::new(config.sleep.clone()));
        let interest = Arc::new(InterestScorer::new(
            config.interest.clone(),
            collaborators.embedder.clone(),
        ));
        if !config.identity.persona.is_empty() {
            interest
                .set_interest_profile(&config.identity.persona)
                .await
                .context("embedding the interest profile")?;
        }

        let worker = Arc::new(StreamWorker::new(
            config.clone(),
            contexts.clone(),
            sleep.clone(),
            interest.clone(),
            collaborators.llm.clone(),
            collaborators.registry.clone(),
            memory.clone(),
            clock.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.scheduling.clone(),
            config.energy.clone(),
            worker,
            clock.clone(),
        ));
        let manager = MessageManager::new(
            config.clone(),
            contexts.clone(),
            dispatcher.clone(),
            sleep.clone(),
            interest.clone(),
            clock.clone(),
        );

        info!(bot = %config.identity.bot_name, "system context initialized");
        Ok(Arc::new(Self {
            config,
            contexts,
            sleep,
            interest,
            memory,
            dispatcher,
            manager,
            clock,
            forgetter,
            maintenance_handles: Mutex::new(Vec::new()),
        }))
    }

    pub async fn start(self: &Arc<Self>) {
        self.dispatcher.start(Duration::from_secs(3_600)).await;
        self.manager.start().await;
        self.spawn_maintenance().await;
        info!("murmur core started");
    }

    pub async fn shutdown(&self) {
        self.manager.stop().await;
        self.dispatcher.stop().await;
        for handle in self.maintenance_handles.lock().await.drain(..) {
            handle.abort();
        }
        info!("murmur core stopped");
    }

    async fn spawn_maintenance(self: &Arc<Self>) {
        let mut handles = self.maintenance_handles.lock().await;

        // Forgetting sweep.
        let forgetter = self.forgetter.clone();
        let clock = self.clock.clone();
        let interval =
            Duration::from_secs(self.config.memory.forgetting_check_interval_hours * 3_600);
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match forgetter.sweep(clock.now_secs()).await {
                    Ok(report) => {
                        if report.deleted > 0 {
                            info!(deleted = report.deleted, "forgetting sweep removed memories");
                        }
                    }
                    Err(err) => error!(%err, "forgetting sweep failed"),
                }
            }
        }));

        // Idle stream context cleanup.
        let contexts = self.contexts.clone();
        let dispatcher = self.dispatcher.clone();
        let clock = self.clock.clone();
        let max_inactive_hours = self.config.scheduling.max_inactive_hours;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                contexts
                    .cleanup_inactive(clock.now_secs(), max_inactive_hours)
                    .await;
                dispatcher.cleanup_inactive_streams(max_inactive_hours).await;
            }
        }));
    }
}

/// Wire `tracing` the way the daemon expects: env filter seeded from
/// the configured level, overridable via `RUST_LOG`.
pub fn init_telemetry(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
