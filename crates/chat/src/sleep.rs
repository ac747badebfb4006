//! Sleep window handling: proactive processing is suppressed inside
//! the configured window, and private messages or mentions accumulate
//! wake value until the bot wakes up.

use tokio::sync::Mutex;
use tracing::{debug, info};

use murmur_config::SleepConfig;

/// Returns `true` when `hour` falls within `[start, end)`, handling
/// windows that wrap midnight (e.g. 23 → 07).
pub fn is_in_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[derive(Debug, Default)]
struct SleepState {
    sleeping: bool,
    wake_value: f64,
}

pub struct SleepManager {
    config: SleepConfig,
    state: Mutex<SleepState>,
}

impl SleepManager {
    pub fn new(config: SleepConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SleepState::default()),
        }
    }

    /// Advance the sleep state for the current hour. Called once per
    /// manager-loop tick. Leaving the window clears the wake value.
    pub async fn advance(&self, hour: u32) {
        let mut state = self.state.lock().await;
        if !self.config.enabled || !is_in_window(hour, self.config.start_hour, self.config.end_hour)
        {
            if state.sleeping {
                info!("sleep window ended, waking up");
            }
            state.sleeping = false;
            state.wake_value = 0.0;
            return;
        }

        // Inside the window: asleep unless already woken past the
        // threshold.
        if state.wake_value < self.config.wake_threshold {
            if !state.sleeping {
                info!(hour, "entering sleep window");
            }
            state.sleeping = true;
        }
    }

    pub async fn is_sleeping(&self) -> bool {
        self.state.lock().await.sleeping
    }

    /// Accumulate wake value from a triggering message. Returns `true`
    /// when this call crossed the threshold and woke the bot.
    pub async fn add_wake_value(&self, is_private: bool, is_mention: bool) -> bool {
        let mut state = self.state.lock().await;
        if !state.sleeping {
            return false;
        }

        if is_private {
            state.wake_value += self.config.private_increment;
        }
        if is_mention {
            state.wake_value += self.config.mention_increment;
        }
        debug!(wake_value = state.wake_value, "wake value accumulated");

        if state.wake_value >= self.config.wake_threshold {
            info!("woken up by accumulated triggers");
            state.sleeping = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SleepManager {
        SleepManager::new(SleepConfig {
            enabled: true,
            start_hour: 23,
            end_hour: 7,
            wake_threshold: 1.0,
            private_increment: 0.6,
            mention_increment: 0.4,
        })
    }

    #[test]
    fn window_wraps_midnight() {
        assert!(is_in_window(23, 23, 7));
        assert!(is_in_window(2, 23, 7));
        assert!(!is_in_window(7, 23, 7));
        assert!(!is_in_window(12, 23, 7));

        assert!(is_in_window(10, 9, 17));
        assert!(!is_in_window(17, 9, 17));
    }

    #[tokio::test]
    async fn sleeps_inside_the_window_and_wakes_outside() {
        let manager = manager();
        manager.advance(2).await;
        assert!(manager.is_sleeping().await);

        manager.advance(8).await;
        assert!(!manager.is_sleeping().await);
    }

    #[tokio::test]
    async fn wake_value_accumulates_to_the_threshold() {
        let manager = manager();
        manager.advance(2).await;

        // One mention is not enough, a private message on top is.
        assert!(!manager.add_wake_value(false, true).await);
        assert!(manager.is_sleeping().await);
        assert!(manager.add_wake_value(true, false).await);
        assert!(!manager.is_sleeping().await);
    }

    #[tokio::test]
    async fn woken_state_persists_for_the_rest_of_the_window() {
        let manager = manager();
        manager.advance(2).await;
        manager.add_wake_value(true, true).await;
        assert!(!manager.is_sleeping().await);

        // Still inside the window on the next tick: stays awake.
        manager.advance(3).await;
        assert!(!manager.is_sleeping().await);
    }

    #[tokio::test]
    async fn disabled_sleep_never_sleeps() {
        let manager = SleepManager::new(SleepConfig {
            enabled: false,
            ..SleepConfig::default()
        });
        manager.advance(2).await;
        assert!(!manager.is_sleeping().await);
    }

    #[tokio::test]
    async fn leaving_the_window_resets_the_wake_accumulator() {
        let manager = manager();
        manager.advance(2).await;
        manager.add_wake_value(false, true).await;

        manager.advance(8).await;
        manager.advance(23).await;
        // Back in a window: the old partial value is gone.
        assert!(manager.is_sleeping().await);
        assert!(!manager.add_wake_value(false, true).await);
    }
}
