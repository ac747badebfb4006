use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identity of the bot as it appears inside planning prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub bot_name: String,
    pub alias_names: Vec<String>,
    /// One-sentence persona injected into every planner prompt.
    pub persona: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bot_name: "Murmur".to_string(),
            alias_names: Vec::new(),
            persona: "a curious, easygoing chat companion".to_string(),
        }
    }
}

/// Dispatch cadence and worker-pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Maximum concurrently executing stream workers.
    pub max_concurrent: usize,
    /// Manager loop fallback interval in seconds.
    pub check_interval_secs: f64,
    /// Base interval for the dynamic per-stream distribution cadence.
    pub dist_base_secs: f64,
    pub dist_min_secs: f64,
    pub dist_max_secs: f64,
    /// Multiplicative jitter applied to the computed interval, in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter_factor: f64,
    pub dynamic_distribution: bool,
    pub max_queue_size: usize,
    pub retry_base_delay_secs: f64,
    pub max_retries: u32,
    pub max_task_history: usize,
    /// Streams idle longer than this (and with no unread) are swept.
    pub max_inactive_hours: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            check_interval_secs: 5.0,
            dist_base_secs: 10.0,
            dist_min_secs: 3.0,
            dist_max_secs: 120.0,
            jitter_factor: 0.1,
            dynamic_distribution: true,
            max_queue_size: 1000,
            retry_base_delay_secs: 5.0,
            max_retries: 3,
            max_task_history: 100,
            max_inactive_hours: 24,
        }
    }
}

/// Pre-emptive interruption of in-flight stream workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    pub enabled: bool,
    /// Interruptions per stream before the feature is suppressed until
    /// the counter resets.
    pub max_limit: u32,
    /// While `count / max_limit` stays at or below this ratio the
    /// interruption probability is 0.8; beyond it the probability decays
    /// as `0.5 ^ (ratio - factor)`.
    pub probability_factor: f64,
    /// Reply-threshold reduction accumulated per interruption.
    pub afc_reduction: f64,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_limit: 3,
            probability_factor: 0.6,
            afc_reduction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// When true, snapshots are processed under a global semaphore and
    /// a per-stream send lock instead of one task per stream.
    pub concurrent_processing: bool,
    /// Bucket unread snapshots by user and run one worker per bucket.
    pub process_by_user_id: bool,
    pub per_user_limit: usize,
    /// Randomized pause after a concurrent-mode reply, seconds.
    pub reply_delay_min_secs: f64,
    pub reply_delay_max_secs: f64,
    /// Promote a consumed snapshot to history even when the plan decided
    /// only `no_action`. When false such snapshots stay unread.
    pub promote_unactioned: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            concurrent_processing: false,
            process_by_user_id: false,
            per_user_limit: 3,
            reply_delay_min_secs: 1.5,
            reply_delay_max_secs: 3.0,
            promote_unactioned: true,
        }
    }
}

/// Interest scoring thresholds and weights.
///
/// The weights are a convex-ish blend; they are not required to sum to
/// one, the final score is clamped to `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestConfig {
    pub reply_threshold: f64,
    pub non_reply_action_threshold: f64,
    pub high_match_threshold: f64,
    pub mention_bonus: f64,
    pub match_weight: f64,
    pub mention_weight: f64,
    pub relationship_weight: f64,
    pub recency_weight: f64,
    /// Age in seconds at which the recency component has halved.
    pub recency_half_life_secs: f64,
    /// Consecutive no-reply decisions tolerated before forcing a reply
    /// candidate.
    pub max_no_reply_count: u32,
    /// Per-step reduction of the effective reply threshold as the
    /// no-reply streak grows.
    pub no_reply_threshold_step: f64,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            reply_threshold: 0.4,
            non_reply_action_threshold: 0.2,
            high_match_threshold: 0.8,
            mention_bonus: 0.3,
            match_weight: 0.5,
            mention_weight: 0.2,
            relationship_weight: 0.15,
            recency_weight: 0.15,
            recency_half_life_secs: 600.0,
            max_no_reply_count: 5,
            no_reply_threshold_step: 0.05,
        }
    }
}

/// Focus-energy blend weights and the energy → interval mapping bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub activity_weight: f64,
    pub interest_weight: f64,
    pub recency_weight: f64,
    pub relationship_weight: f64,
    /// Interval returned at energy 0 / energy 1 respectively.
    pub interval_at_rest_secs: f64,
    pub interval_at_peak_secs: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            activity_weight: 0.3,
            interest_weight: 0.3,
            recency_weight: 0.2,
            relationship_weight: 0.2,
            interval_at_rest_secs: 90.0,
            interval_at_peak_secs: 5.0,
        }
    }
}

/// Long-term memory engine tuning: build throttle, value gate, fusion,
/// the four retrieval stages, and forgetting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub min_build_interval_secs: f64,
    pub value_threshold: f64,
    pub fusion_threshold: f64,
    pub vector_similarity_threshold: f64,
    pub semantic_similarity_threshold: f64,
    pub metadata_filter_limit: usize,
    pub vector_search_limit: usize,
    pub semantic_rerank_limit: usize,
    pub final_result_limit: usize,
    pub vector_weight: f64,
    pub semantic_weight: f64,
    pub context_weight: f64,
    pub recency_weight: f64,
    /// Prior history window resolved as the ingest transcript.
    pub history_limit: usize,
    /// Hard cutoff: anything older may be forgotten unconditionally.
    pub retention_hours: u64,
    pub base_retention_days: f64,
    pub importance_bonus_days: f64,
    pub confidence_bonus_days: f64,
    /// Extra retention per recorded access, capped in the sweep.
    pub access_bonus_days: f64,
    pub forgetting_check_interval_hours: u64,
    /// LRU size of the hydrated chunk cache in front of the store.
    pub cache_size: usize,
    /// Must equal the embedding provider's dimension.
    pub embedding_dimension: usize,
    pub llm_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_build_interval_secs: 300.0,
            value_threshold: 0.7,
            fusion_threshold: 0.85,
            vector_similarity_threshold: 0.7,
            semantic_similarity_threshold: 0.6,
            metadata_filter_limit: 100,
            vector_search_limit: 50,
            semantic_rerank_limit: 20,
            final_result_limit: 10,
            vector_weight: 0.4,
            semantic_weight: 0.3,
            context_weight: 0.2,
            recency_weight: 0.1,
            history_limit: 40,
            retention_hours: 2160,
            base_retention_days: 30.0,
            importance_bonus_days: 10.0,
            confidence_bonus_days: 5.0,
            access_bonus_days: 0.5,
            forgetting_check_interval_hours: 24,
            cache_size: 256,
            embedding_dimension: 768,
            llm_timeout_secs: 30,
        }
    }
}

/// Sleep window plus wake-up accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub enabled: bool,
    /// Local hours, `[start, end)`, may wrap midnight.
    pub start_hour: u32,
    pub end_hour: u32,
    /// Accumulated wake value needed to exit sleep.
    pub wake_threshold: f64,
    pub private_increment: f64,
    pub mention_increment: f64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 23,
            end_hour: 7,
            wake_threshold: 1.0,
            private_increment: 0.6,
            mention_increment: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub identity: IdentityConfig,
    pub scheduling: SchedulingConfig,
    pub interruption: InterruptionConfig,
    pub concurrency: ConcurrencyConfig,
    pub interest: InterestConfig,
    pub energy: EnergyConfig,
    pub memory: MemoryConfig,
    pub sleep: SleepConfig,
    pub telemetry: TelemetryConfig,
}

impl CoreConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent. `MURMUR_LOG` overrides the configured log level.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(level) = env::var("MURMUR_LOG") {
            if !level.is_empty() {
                config.telemetry.log_level = level;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::CoreConfig;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let config = CoreConfig::load_from("/nonexistent/murmur.toml")?;
        assert_eq!(config.scheduling.max_concurrent, 3);
        assert_eq!(config.memory.final_result_limit, 10);
        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("murmur.toml");
        std::fs::write(&path, "[scheduling]\nmax_concurrent = 8\n")?;

        let config = CoreConfig::load_from(&path)?;
        assert_eq!(config.scheduling.max_concurrent, 8);
        assert_eq!(config.interest.reply_threshold, 0.4);
        Ok(())
    }

    #[test]
    fn save_and_reload_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/murmur.toml");

        let mut config = CoreConfig::default();
        config.identity.bot_name = "Fern".to_string();
        config.memory.embedding_dimension = 1024;
        config.save_to(&path)?;

        let reloaded = CoreConfig::load_from(&path)?;
        assert_eq!(reloaded.identity.bot_name, "Fern");
        assert_eq!(reloaded.memory.embedding_dimension, 1024);
        Ok(())
    }
}
