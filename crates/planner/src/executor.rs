//! Executes a decided plan through the action registry. Individual
//! action failures are logged and never abort the batch.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::action::{ActionContext, ActionRegistry, ActionType};
use crate::plan::{Plan, PlanState};

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action_type: ActionType,
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub results: Vec<ActionResult>,
    pub reply_succeeded: bool,
}

impl ExecutionReport {
    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

pub struct PlanExecutor {
    registry: Arc<dyn ActionRegistry>,
}

impl PlanExecutor {
    pub fn new(registry: Arc<dyn ActionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, plan: &mut Plan, context: &ActionContext) -> ExecutionReport {
        plan.state = PlanState::Executing;
        let mut report = ExecutionReport::default();
        let mut attempted = 0usize;

        for decision in &plan.decided_actions {
            if decision.action_type.is_noop() {
                debug!(
                    stream = %plan.stream_id,
                    action = decision.action_type.name(),
                    reasoning = %decision.reasoning,
                    "skipping no-op decision"
                );
                continue;
            }
            attempted += 1;

            let outcome = self
                .registry
                .invoke(
                    decision.action_type.name(),
                    decision.data.clone(),
                    decision.target_message.as_ref(),
                    context,
                )
                .await;

            match outcome {
                Ok(outcome) => {
                    if outcome.success && decision.action_type.is_reply_kind() {
                        report.reply_succeeded = true;
                    }
                    info!(
                        stream = %plan.stream_id,
                        action = decision.action_type.name(),
                        success = outcome.success,
                        "action executed"
                    );
                    report.results.push(ActionResult {
                        action_type: decision.action_type.clone(),
                        success: outcome.success,
                        detail: outcome.detail,
                    });
                }
                Err(err) => {
                    error!(
                        stream = %plan.stream_id,
                        action = decision.action_type.name(),
                        %err,
                        "action invocation failed"
                    );
                    report.results.push(ActionResult {
                        action_type: decision.action_type.clone(),
                        success: false,
                        detail: Some(err.to_string()),
                    });
                }
            }
        }

        plan.state = if attempted > 0 && report.successful_count() == 0 {
            PlanState::Failed
        } else {
            PlanState::Executed
        };
        report
    }
}
