// Per-Key Migration State Machine
//
// Tracks where the orchestrator is for one resource key and rejects
// transitions that would skip a step (for example committing without
// applying, or reopening a finished key).

use serde::Serialize;

/// Lifecycle phase of one resource key within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPhase {
    /// Reading the ledger and computing pending descriptors.
    Planning,

    /// Invoking the resource driver for the next pending descriptor.
    Applying,

    /// Recording the descriptor just applied.
    Committing,

    /// Every pending descriptor is applied and recorded.
    Done,

    /// Stopped; earlier commits stand.
    Failed,
}

impl KeyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeyPhase::Done | KeyPhase::Failed)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("illegal phase transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct PhaseMachine {
    phase: KeyPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    /// Every key starts out planning.
    pub fn new() -> Self {
        Self {
            phase: KeyPhase::Planning,
        }
    }

    pub fn advance(&mut self, next: KeyPhase) -> Result<(), PhaseError> {
        use KeyPhase::*;

        self.phase = match (self.phase, next) {
            (Planning, Applying | Done) => next,
            (Applying, Committing | Done) => next,

            // Next descriptor, or replan after a conflict
            (Committing, Applying | Planning) => next,

            (current, Failed) if !current.is_terminal() => Failed,

            (current, next) => {
                return Err(PhaseError::IllegalTransition(format!(
                    "cannot move from {current:?} to {next:?}"
                )))
            }
        };

        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), PhaseError> {
        self.advance(KeyPhase::Failed)
    }

    pub fn current(&self) -> KeyPhase {
        self.phase
    }
}
