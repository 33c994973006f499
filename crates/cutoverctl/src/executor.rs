//! Plan executor
//!
//! Reports where a resumed upgrade goes next along its own path. Performing
//! the side effects (proposal submission, node restarts) belongs to the
//! execution engine, not to this tool.

use async_trait::async_trait;
use cutover_common::{Stage, StateTransitioner, UpgradeExecutor, UpgradeState};
use owo_colors::OwoColorize;
use std::sync::Mutex;
use tracing::info;

#[derive(Default)]
pub struct PlanExecutor {
    transitioner: StateTransitioner,
    planned: Mutex<Option<Stage>>,
}

impl PlanExecutor {
    pub fn new(transitioner: StateTransitioner) -> Self {
        Self {
            transitioner,
            planned: Mutex::new(None),
        }
    }

    /// Stage chosen by the last `execute` call
    pub fn planned(&self) -> Option<Stage> {
        *self.planned.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UpgradeExecutor for PlanExecutor {
    async fn execute(&self, state: &UpgradeState) -> cutover_common::Result<()> {
        let next = self.transitioner.next_stage_for(state);
        *self.planned.lock().unwrap_or_else(|e| e.into_inner()) = next;

        match next {
            Some(stage) => {
                info!(upgrade = %state.upgrade_name, from = %state.stage, next = %stage, "resume plan");
                println!(
                    "{}  next stage: {} ({})",
                    "→".bright_cyan(),
                    stage.to_string().bold(),
                    stage.description()
                );
            }
            None => {
                println!("{}  no further stage after {}", "✓".bright_green(), state.stage);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_common::Mode;

    #[tokio::test]
    async fn test_plan_follows_state_path() {
        let executor = PlanExecutor::default();

        let gov = UpgradeState::new("v2.0.0", Mode::Local, false);
        executor.execute(&gov).await.unwrap();
        assert_eq!(executor.planned(), Some(Stage::ProposalSubmitted));

        let skip = UpgradeState::new("v2.0.0", Mode::Docker, true);
        executor.execute(&skip).await.unwrap();
        assert_eq!(executor.planned(), Some(Stage::SwitchingBinary));
    }
}
