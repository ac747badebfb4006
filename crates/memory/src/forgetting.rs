//! Background forgetting: memories whose adjusted retention window has
//! elapsed are deleted from the store.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_config::MemoryConfig;

use crate::chunk::{GLOBAL_SCOPE, MemoryChunk};
use crate::store::{MemoryStore, MetadataFilter};

/// Extra retention from access frequency is capped so a hot memory
/// cannot become effectively immortal.
const MAX_ACCESS_BONUS_DAYS: f64 = 15.0;

#[derive(Debug, Clone, Default)]
pub struct ForgettingReport {
    pub scanned: usize,
    pub deleted: usize,
    pub hard_expired: usize,
}

pub struct MemoryForgetter {
    config: MemoryConfig,
    store: Arc<MemoryStore>,
}

impl MemoryForgetter {
    pub fn new(config: MemoryConfig, store: Arc<MemoryStore>) -> Self {
        Self { config, store }
    }

    /// Retention for one memory, in days: base plus importance,
    /// confidence, and activation bonuses.
    fn retention_days(&self, chunk: &MemoryChunk) -> f64 {
        let importance_bonus = (chunk.importance.value() as f64 - 1.0) / 3.0
            * self.config.importance_bonus_days;
        let confidence_bonus = (chunk.confidence.value() as f64 - 1.0) / 3.0
            * self.config.confidence_bonus_days;
        let access_bonus =
            (chunk.access_count as f64 * self.config.access_bonus_days).min(MAX_ACCESS_BONUS_DAYS);

        self.config.base_retention_days + importance_bonus + confidence_bonus + access_bonus
    }

    /// One sweep over the store. Deletes memories idle past their
    /// retention window plus anything older than the hard cutoff.
    pub async fn sweep(&self, now: f64) -> Result<ForgettingReport> {
        let chunks = self
            .store
            .get_by_filter(
                MetadataFilter::default().eq("user_id", json!(GLOBAL_SCOPE)),
                usize::MAX,
            )
            .await?;

        let hard_cutoff_secs = self.config.retention_hours as f64 * 3_600.0;
        let mut report = ForgettingReport {
            scanned: chunks.len(),
            ..ForgettingReport::default()
        };
        let mut doomed: Vec<Uuid> = Vec::new();

        for chunk in &chunks {
            let age = now - chunk.created_at;
            if age > hard_cutoff_secs {
                report.hard_expired += 1;
                doomed.push(chunk.id);
                continue;
            }

            let idle = now - chunk.last_accessed;
            let retention_secs = self.retention_days(chunk) * 86_400.0;
            if idle > retention_secs {
                debug!(
                    id = %chunk.id,
                    idle_days = idle / 86_400.0,
                    retention_days = retention_secs / 86_400.0,
                    "forgetting idle memory"
                );
                doomed.push(chunk.id);
            }
        }

        if !doomed.is_empty() {
            report.deleted = self.store.delete(&doomed).await?;
            info!(
                deleted = report.deleted,
                hard_expired = report.hard_expired,
                scanned = report.scanned,
                "forgetting sweep finished"
            );
        }
        Ok(report)
    }
}
