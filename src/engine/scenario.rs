//! Scenario attachment and step navigation.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::error::EngineError;
use crate::model::{
    LogActor, LogEvent, NewLogEntry, Scenario, ScenarioState, ScenarioStep,
};
use crate::store::Store;

/// Step navigation direction when no explicit target is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Manages the scenario attached to a conversation and its active-step
/// cursor. Every successful mutation appends an audit entry.
pub struct ScenarioEngine {
    store: Arc<dyn Store>,
}

impl ScenarioEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Attach a scenario to a conversation. Without an explicit starting
    /// step the cursor lands on the lowest `order_index` step, or nowhere
    /// for an empty scenario.
    pub async fn assign(
        &self,
        conversation_id: i64,
        scenario_id: i64,
        starting_step: Option<i64>,
        notes: Option<String>,
    ) -> Result<ScenarioState, EngineError> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        let scenario = self
            .store
            .get_scenario(scenario_id)
            .await?
            .ok_or(EngineError::ScenarioNotFound(scenario_id))?;

        let active_step_id = match starting_step {
            Some(step_id) => Some(owned_step(&scenario, step_id)?.id),
            None => scenario.first_step().map(|s| s.id),
        };

        let state = ScenarioState {
            conversation_id,
            scenario_id,
            active_step_id,
            notes,
        };
        self.store.upsert_scenario_state(&state).await?;
        self.store
            .append_log(NewLogEntry {
                conversation_id,
                event: LogEvent::ScenarioAssigned,
                actor: LogActor::Manager,
                summary: format!("Scenario '{}' assigned", scenario.name),
                details: Some(json!({
                    "scenario_id": scenario_id,
                    "active_step_id": active_step_id,
                })),
                context: None,
            })
            .await?;
        info!(conversation_id, scenario_id, "Scenario assigned");
        Ok(state)
    }

    /// Move the active-step cursor. An explicit `step` wins outright;
    /// otherwise `direction` moves one position with a no-op at either end.
    /// With no step, no direction, and no active step, the cursor defaults
    /// to the first step.
    pub async fn advance(
        &self,
        conversation_id: i64,
        step: Option<i64>,
        direction: Option<Direction>,
    ) -> Result<ScenarioState, EngineError> {
        let mut state = self
            .store
            .scenario_state(conversation_id)
            .await?
            .ok_or(EngineError::NoScenarioAssigned(conversation_id))?;
        let scenario = self
            .store
            .get_scenario(state.scenario_id)
            .await?
            .ok_or(EngineError::ScenarioNotFound(state.scenario_id))?;

        state.active_step_id = match step {
            Some(step_id) => Some(owned_step(&scenario, step_id)?.id),
            None => match state.active_step_id {
                None => scenario.first_step().map(|s| s.id),
                Some(current) => {
                    let position = scenario.steps.iter().position(|s| s.id == current);
                    match (position, direction) {
                        (Some(i), Some(Direction::Next)) => {
                            Some(scenario.steps.get(i + 1).map_or(current, |s| s.id))
                        }
                        (Some(i), Some(Direction::Previous)) => Some(if i > 0 {
                            scenario.steps[i - 1].id
                        } else {
                            current
                        }),
                        _ => Some(current),
                    }
                }
            },
        };

        self.store
            .set_active_step(conversation_id, state.active_step_id)
            .await?;
        self.store
            .append_log(NewLogEntry {
                conversation_id,
                event: LogEvent::ScenarioStepChanged,
                actor: LogActor::Manager,
                summary: "Scenario step changed".to_string(),
                details: Some(json!({
                    "scenario_id": state.scenario_id,
                    "active_step_id": state.active_step_id,
                })),
                context: None,
            })
            .await?;
        Ok(state)
    }

    /// Read-only projection: the step after the active one, the first step
    /// if nothing is active, or none at the end of the scenario.
    pub async fn next_suggested_step(
        &self,
        conversation_id: i64,
    ) -> Result<Option<ScenarioStep>, EngineError> {
        let Some(state) = self.store.scenario_state(conversation_id).await? else {
            return Ok(None);
        };
        let scenario = self
            .store
            .get_scenario(state.scenario_id)
            .await?
            .ok_or(EngineError::ScenarioNotFound(state.scenario_id))?;

        Ok(match state.active_step_id {
            None => scenario.first_step().cloned(),
            Some(current) => scenario
                .steps
                .iter()
                .position(|s| s.id == current)
                .and_then(|i| scenario.steps.get(i + 1))
                .cloned(),
        })
    }

    /// Current scenario snapshot for prompt building: the scenario and its
    /// active step, if one is assigned.
    pub async fn active_scenario(
        &self,
        conversation_id: i64,
    ) -> Result<Option<(Scenario, Option<ScenarioStep>)>, EngineError> {
        let Some(state) = self.store.scenario_state(conversation_id).await? else {
            return Ok(None);
        };
        let Some(scenario) = self.store.get_scenario(state.scenario_id).await? else {
            return Ok(None);
        };
        let step = state
            .active_step_id
            .and_then(|id| scenario.step(id).cloned());
        Ok(Some((scenario, step)))
    }
}

fn owned_step(scenario: &Scenario, step_id: i64) -> Result<&ScenarioStep, EngineError> {
    scenario
        .step(step_id)
        .ok_or(EngineError::StepNotInScenario {
            step_id,
            scenario_id: scenario.id,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationStatus, NewScenario, NewScenarioStep};
    use crate::store::MemoryStore;

    async fn setup(steps: usize) -> (Arc<MemoryStore>, ScenarioEngine, i64, i64, Vec<i64>) {
        let store = Arc::new(MemoryStore::new());
        let engine = ScenarioEngine::new(store.clone());
        let client = store.create_client("a@x.com", None).await.unwrap();
        let conversation = store
            .create_conversation(
                client.id,
                None,
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        let scenario = store
            .create_scenario(NewScenario {
                name: "Flow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut step_ids = Vec::new();
        for i in 0..steps {
            let step = store
                .add_scenario_step(
                    scenario.id,
                    NewScenarioStep {
                        order_index: i as i64 + 1,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            step_ids.push(step.id);
        }
        (store, engine, conversation.id, scenario.id, step_ids)
    }

    #[tokio::test]
    async fn assign_defaults_to_lowest_order_step() {
        let (_, engine, conversation_id, scenario_id, steps) = setup(3).await;
        let state = engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        assert_eq!(state.active_step_id, Some(steps[0]));
    }

    #[tokio::test]
    async fn assign_to_empty_scenario_has_no_active_step() {
        let (_, engine, conversation_id, scenario_id, _) = setup(0).await;
        let state = engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        assert_eq!(state.active_step_id, None);
    }

    #[tokio::test]
    async fn explicit_step_wins_over_direction() {
        let (_, engine, conversation_id, scenario_id, steps) = setup(3).await;
        engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        let state = engine
            .advance(conversation_id, Some(steps[2]), Some(Direction::Previous))
            .await
            .unwrap();
        assert_eq!(state.active_step_id, Some(steps[2]));
    }

    #[tokio::test]
    async fn next_is_noop_at_last_step() {
        let (_, engine, conversation_id, scenario_id, steps) = setup(2).await;
        engine
            .assign(conversation_id, scenario_id, Some(steps[1]), None)
            .await
            .unwrap();
        for _ in 0..3 {
            let state = engine
                .advance(conversation_id, None, Some(Direction::Next))
                .await
                .unwrap();
            assert_eq!(state.active_step_id, Some(steps[1]));
        }
    }

    #[tokio::test]
    async fn previous_is_noop_at_first_step() {
        let (_, engine, conversation_id, scenario_id, steps) = setup(2).await;
        engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        let state = engine
            .advance(conversation_id, None, Some(Direction::Previous))
            .await
            .unwrap();
        assert_eq!(state.active_step_id, Some(steps[0]));
    }

    #[tokio::test]
    async fn foreign_step_is_rejected() {
        let (store, engine, conversation_id, scenario_id, _) = setup(1).await;
        let other = store
            .create_scenario(NewScenario {
                name: "Other".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let foreign = store
            .add_scenario_step(other.id, NewScenarioStep::default())
            .await
            .unwrap();

        let result = engine
            .assign(conversation_id, scenario_id, Some(foreign.id), None)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::StepNotInScenario { .. })
        ));
    }

    #[tokio::test]
    async fn advance_without_assignment_fails() {
        let (_, engine, conversation_id, _, _) = setup(1).await;
        let result = engine.advance(conversation_id, None, None).await;
        assert!(matches!(result, Err(EngineError::NoScenarioAssigned(_))));
    }

    #[tokio::test]
    async fn next_suggested_step_projection() {
        let (store, engine, conversation_id, scenario_id, steps) = setup(2).await;
        assert!(engine
            .next_suggested_step(conversation_id)
            .await
            .unwrap()
            .is_none());

        engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        let suggested = engine
            .next_suggested_step(conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(suggested.id, steps[1]);

        store
            .set_active_step(conversation_id, Some(steps[1]))
            .await
            .unwrap();
        assert!(engine
            .next_suggested_step(conversation_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mutations_append_audit_entries() {
        let (store, engine, conversation_id, scenario_id, _) = setup(2).await;
        engine
            .assign(conversation_id, scenario_id, None, None)
            .await
            .unwrap();
        engine
            .advance(conversation_id, None, Some(Direction::Next))
            .await
            .unwrap();
        engine
            .advance(conversation_id, None, Some(Direction::Next))
            .await
            .unwrap();

        let events: Vec<LogEvent> = store
            .log_entries(conversation_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![
                LogEvent::ScenarioAssigned,
                LogEvent::ScenarioStepChanged,
                LogEvent::ScenarioStepChanged,
            ]
        );
    }
}
