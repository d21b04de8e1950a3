//! Backend target fallback state machine
//!
//! Targets are tried in priority order. Each gets a fresh credential retry
//! budget; only the attempt count and the last error text carry over. A
//! target is abandoned for the next one when its pool ran dry, its budget ran
//! out, or upstream reported the quota as exhausted. Other fatal failures
//! would fail the same way everywhere and surface immediately.

use provider::ErrorCategory;

use crate::error::GatewayError;
use crate::orchestrator::attempt::AttemptFailure;
use crate::pool::NoCandidateReason;

#[derive(Debug, Clone)]
pub struct TargetState {
    /// Requested model, for error messages
    pub model: String,
    pub current: usize,
    pub total: usize,
    /// Attempts across every target tried so far
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl TargetState {
    pub fn new(model: impl Into<String>, total: usize) -> Self {
        Self {
            model: model.into(),
            current: 0,
            total,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub enum TargetEvent {
    Start,
    Succeeded,
    Failed(AttemptFailure),
}

#[derive(Debug)]
pub enum TargetAction {
    Dispatch { index: usize },
    Complete,
    Surface(GatewayError),
}

fn falls_through(failure: &AttemptFailure) -> bool {
    match failure {
        AttemptFailure::NoCandidate(_) | AttemptFailure::Exhausted { .. } => true,
        AttemptFailure::Fatal { last, .. } => {
            last.classification.category == ErrorCategory::QuotaExhausted
        }
    }
}

fn no_candidate_error(reason: NoCandidateReason, model: String) -> GatewayError {
    match reason {
        NoCandidateReason::NoTierAccess => GatewayError::NoTierAccess { model },
        NoCandidateReason::NoPublicAccess => GatewayError::NoPublicAccess,
        NoCandidateReason::NoCredential => GatewayError::NoCredential,
    }
}

fn final_error(state: TargetState, failure: AttemptFailure) -> GatewayError {
    match failure {
        AttemptFailure::Fatal { last, .. } => GatewayError::Upstream {
            status: last.status,
            category: last.classification.category,
            attempts: state.attempts,
            message: last.message,
        },
        AttemptFailure::NoCandidate(reason) if state.attempts == 0 => {
            no_candidate_error(reason, state.model)
        }
        AttemptFailure::NoCandidate(_) | AttemptFailure::Exhausted { .. } => {
            GatewayError::AllRetriesExhausted {
                attempts: state.attempts,
                last_error: state
                    .last_error
                    .unwrap_or_else(|| "no credential available".to_string()),
            }
        }
    }
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(mut state: TargetState, event: TargetEvent) -> (TargetState, TargetAction) {
    match event {
        TargetEvent::Start if state.total == 0 => (state, TargetAction::Surface(GatewayError::NoCredential)),
        TargetEvent::Start => {
            state.current = 0;
            (state, TargetAction::Dispatch { index: 0 })
        }

        TargetEvent::Succeeded => (state, TargetAction::Complete),

        TargetEvent::Failed(failure) => {
            state.attempts += failure.attempts();
            if let Some(last) = failure.last() {
                state.last_error = Some(last.message.clone());
            }

            if falls_through(&failure) && state.current + 1 < state.total {
                state.current += 1;
                let index = state.current;
                return (state, TargetAction::Dispatch { index });
            }
            let error = final_error(state.clone(), failure);
            (state, TargetAction::Surface(error))
        }
    }
}
