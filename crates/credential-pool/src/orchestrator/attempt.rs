//! Credential retry state machine for one backend target
//!
//! Pure: receives events, returns (new_state, action). The orchestrator
//! executes the I/O each action implies (select, call) and feeds the result
//! back as the next event.
//!
//! A failure moves on to another credential when switching can help: the
//! classifier marked it retryable, or the credential itself is broken.
//! Anything else (bad request, content filter, quota exhaustion) gives up
//! at once without spending more of the budget.

use std::collections::HashSet;

use provider::Classification;

use crate::model::CredentialId;
use crate::pool::NoCandidateReason;

/// What went wrong on the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub credential_id: CredentialId,
    /// HTTP status, 0 for transport and token failures
    pub status: u16,
    pub classification: Classification,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AttemptState {
    /// Credentials already tried for this target
    pub excluded: HashSet<CredentialId>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_failure: Option<FailureRecord>,
}

impl AttemptState {
    /// `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            excluded: HashSet::new(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_failure: None,
        }
    }
}

#[derive(Debug)]
pub enum AttemptEvent {
    Start,
    /// Pool handed out a credential
    Selected(CredentialId),
    /// Pool had nothing left to hand out
    NoCandidate(NoCandidateReason),
    /// Token resolution or the backend call failed
    Failed(FailureRecord),
    Succeeded,
}

/// Why a target gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Nothing to try on the very first selection
    NoCandidate(NoCandidateReason),
    /// Switched credentials until the budget or the pool ran out
    Exhausted { attempts: u32, last: FailureRecord },
    /// A failure switching credentials cannot fix
    Fatal { attempts: u32, last: FailureRecord },
}

impl AttemptFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            AttemptFailure::NoCandidate(_) => 0,
            AttemptFailure::Exhausted { attempts, .. } | AttemptFailure::Fatal { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last(&self) -> Option<&FailureRecord> {
        match self {
            AttemptFailure::NoCandidate(_) => None,
            AttemptFailure::Exhausted { last, .. } | AttemptFailure::Fatal { last, .. } => {
                Some(last)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttemptAction {
    Select,
    Call { credential_id: CredentialId },
    Complete,
    GiveUp(AttemptFailure),
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(mut state: AttemptState, event: AttemptEvent) -> (AttemptState, AttemptAction) {
    match event {
        AttemptEvent::Start => (state, AttemptAction::Select),

        AttemptEvent::Selected(credential_id) => {
            state.attempts += 1;
            state.excluded.insert(credential_id);
            (state, AttemptAction::Call { credential_id })
        }

        AttemptEvent::NoCandidate(reason) => {
            let failure = match state.last_failure.clone() {
                Some(last) => AttemptFailure::Exhausted {
                    attempts: state.attempts,
                    last,
                },
                None => AttemptFailure::NoCandidate(reason),
            };
            (state, AttemptAction::GiveUp(failure))
        }

        AttemptEvent::Failed(record) => {
            let switch = record.classification.retryable || record.classification.disable;
            state.last_failure = Some(record.clone());
            let action = if !switch {
                AttemptAction::GiveUp(AttemptFailure::Fatal {
                    attempts: state.attempts,
                    last: record,
                })
            } else if state.attempts < state.max_attempts {
                AttemptAction::Select
            } else {
                AttemptAction::GiveUp(AttemptFailure::Exhausted {
                    attempts: state.attempts,
                    last: record,
                })
            };
            (state, action)
        }

        AttemptEvent::Succeeded => (state, AttemptAction::Complete),
    }
}
