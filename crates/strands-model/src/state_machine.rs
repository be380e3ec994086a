//! Model lifecycle state machine.
//!
//! Every load, generate, and unload walks this graph; anything outside it
//! fails with `InvalidTransition`. The last 100 transitions (including
//! rejected ones) are kept in a ring buffer for the status endpoint.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use strands_types::StrandError;

const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Idle,
    Loading,
    Loaded,
    Generating,
    Unloading,
    Error,
}

impl ModelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Generating => "generating",
            Self::Unloading => "unloading",
            Self::Error => "error",
        }
    }

    fn valid_next(self) -> &'static [ModelState] {
        match self {
            Self::Idle => &[Self::Loading, Self::Error],
            Self::Loading => &[Self::Loaded, Self::Idle, Self::Error],
            Self::Loaded => &[Self::Generating, Self::Unloading, Self::Error],
            Self::Generating => &[Self::Loaded, Self::Error],
            Self::Unloading => &[Self::Idle, Self::Error],
            Self::Error => &[Self::Idle, Self::Loading, Self::Unloading],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from_state: ModelState,
    pub to_state: ModelState,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ModelStateMachine {
    current: ModelState,
    history: VecDeque<StateTransition>,
}

impl Default for ModelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStateMachine {
    pub fn new() -> Self {
        Self {
            current: ModelState::Idle,
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    pub fn current(&self) -> ModelState {
        self.current
    }

    pub fn can_transition(&self, to: ModelState) -> bool {
        self.current.valid_next().contains(&to)
    }

    /// Execute a transition, recording it either way.
    pub fn transition(&mut self, to: ModelState) -> Result<(), StrandError> {
        if !self.can_transition(to) {
            let err = StrandError::InvalidTransition {
                from: self.current.as_str().to_string(),
                to: to.as_str().to_string(),
            };
            self.record(self.current, to, false, Some(err.to_string()));
            tracing::error!(from = self.current.as_str(), to = to.as_str(), "invalid transition");
            return Err(err);
        }
        let from = self.current;
        self.current = to;
        self.record(from, to, true, None);
        tracing::info!(from = from.as_str(), to = to.as_str(), "state transition");
        Ok(())
    }

    /// The state the machine recovers into after an error in the current
    /// state: LOADING -> IDLE, GENERATING -> LOADED, UNLOADING -> IDLE,
    /// everything else -> IDLE.
    pub fn recovery_target(&self) -> ModelState {
        match self.current {
            ModelState::Generating => ModelState::Loaded,
            _ => ModelState::Idle,
        }
    }

    /// Enter ERROR (recording the cause), returning the recovery target the
    /// caller should transition to after its backoff.
    pub fn handle_error(&mut self, error: &str) -> ModelState {
        let target = self.recovery_target();
        let from = self.current;
        self.current = ModelState::Error;
        self.record(from, ModelState::Error, true, Some(error.to_string()));
        tracing::error!(from = from.as_str(), %error, "entering error state");
        target
    }

    /// Force a state without graph checks. Only the emergency shutdown path
    /// uses this.
    pub fn force(&mut self, to: ModelState) {
        let from = self.current;
        self.current = to;
        self.record(from, to, true, Some("forced".to_string()));
    }

    pub fn is_operational(&self) -> bool {
        matches!(
            self.current,
            ModelState::Idle | ModelState::Loaded | ModelState::Generating
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.current,
            ModelState::Loading | ModelState::Generating | ModelState::Unloading
        )
    }

    pub fn can_accept_requests(&self) -> bool {
        self.current == ModelState::Loaded
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn stats(&self) -> StateMachineStats {
        let total = self.history.len();
        let successful = self.history.iter().filter(|t| t.success).count();
        let mut transition_counts: HashMap<String, usize> = HashMap::new();
        for t in &self.history {
            let key = format!("{}->{}", t.from_state.as_str(), t.to_state.as_str());
            *transition_counts.entry(key).or_insert(0) += 1;
        }
        StateMachineStats {
            current_state: self.current,
            total_transitions: total,
            successful_transitions: successful,
            failed_transitions: total - successful,
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
            transition_counts,
        }
    }

    fn record(&mut self, from: ModelState, to: ModelState, success: bool, error: Option<String>) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
            success,
            error,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateMachineStats {
    pub current_state: ModelState,
    pub total_transitions: usize,
    pub successful_transitions: usize,
    pub failed_transitions: usize,
    pub success_rate: f64,
    pub transition_counts: HashMap<String, usize>,
}
