use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state carried by every governance record. The state is the
/// single source of truth for promotion and binding gates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "lifecycle_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Draft,
    Approved,
    Deprecated,
    Archived,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Approved => "approved",
            LifecycleState::Deprecated => "deprecated",
            LifecycleState::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(LifecycleState::Draft),
            "approved" => Some(LifecycleState::Approved),
            "deprecated" => Some(LifecycleState::Deprecated),
            "archived" => Some(LifecycleState::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransitionErrorCode {
    #[serde(rename = "LIFECYCLE_TRANSITION_DENIED")]
    TransitionDenied,
    #[serde(rename = "LIFECYCLE_INVALID_TRANSITION")]
    InvalidTransition,
}

#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("{message}")]
pub struct TransitionError {
    pub code: TransitionErrorCode,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub message: String,
}

/// Outcome of a validated transition. `noop` marks a same-state request,
/// which is always allowed and must not mutate anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub requires_approval: bool,
    pub noop: bool,
}

const ALLOWED: &[(LifecycleState, LifecycleState, bool)] = &[
    (LifecycleState::Draft, LifecycleState::Approved, true),
    (LifecycleState::Approved, LifecycleState::Deprecated, false),
    (LifecycleState::Deprecated, LifecycleState::Archived, true),
    (LifecycleState::Approved, LifecycleState::Archived, true),
    (LifecycleState::Deprecated, LifecycleState::Approved, true),
    (LifecycleState::Archived, LifecycleState::Deprecated, true),
    (LifecycleState::Archived, LifecycleState::Draft, true),
];

const DENIED: &[(LifecycleState, LifecycleState, &str)] = &[
    (
        LifecycleState::Draft,
        LifecycleState::Deprecated,
        "draft assets cannot be deprecated; approve them first",
    ),
    (
        LifecycleState::Draft,
        LifecycleState::Archived,
        "draft assets cannot be archived; approve them first",
    ),
    (
        LifecycleState::Archived,
        LifecycleState::Approved,
        "archived assets must be restored to draft or deprecated before re-approval",
    ),
];

/// Stateless validator for lifecycle transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleMachine;

impl LifecycleMachine {
    pub fn validate(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<Transition, TransitionError> {
        if from == to {
            return Ok(Transition {
                requires_approval: false,
                noop: true,
            });
        }
        if let Some((_, _, requires_approval)) = ALLOWED
            .iter()
            .find(|(f, t, _)| *f == from && *t == to)
            .copied()
        {
            return Ok(Transition {
                requires_approval,
                noop: false,
            });
        }
        if let Some((_, _, message)) = DENIED.iter().find(|(f, t, _)| *f == from && *t == to) {
            return Err(TransitionError {
                code: TransitionErrorCode::TransitionDenied,
                from,
                to,
                message: (*message).to_string(),
            });
        }
        Err(TransitionError {
            code: TransitionErrorCode::InvalidTransition,
            from,
            to,
            message: format!("no transition from {from} to {to}"),
        })
    }

    pub fn requires_approval(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.validate(from, to)
            .map(|t| t.requires_approval)
            .unwrap_or(false)
    }

    /// Valid targets from a given state, for UI hinting.
    pub fn allowed_transitions(&self, from: LifecycleState) -> Vec<LifecycleState> {
        ALLOWED
            .iter()
            .filter(|(f, _, _)| *f == from)
            .map(|(_, t, _)| *t)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn approval_required_edges() {
        let machine = LifecycleMachine;
        assert!(machine.requires_approval(Draft, Approved));
        assert!(!machine.requires_approval(Approved, Deprecated));
        assert!(machine.requires_approval(Deprecated, Archived));
        assert!(machine.requires_approval(Approved, Archived));
        assert!(machine.requires_approval(Deprecated, Approved));
        assert!(machine.requires_approval(Archived, Deprecated));
        assert!(machine.requires_approval(Archived, Draft));
    }

    #[test]
    fn same_state_is_noop() {
        let machine = LifecycleMachine;
        for state in [Draft, Approved, Deprecated, Archived] {
            let transition = machine.validate(state, state).unwrap();
            assert!(transition.noop);
            assert!(!transition.requires_approval);
        }
    }

    #[test]
    fn explicit_denials_use_denied_code() {
        let machine = LifecycleMachine;
        for (from, to) in [(Draft, Deprecated), (Draft, Archived), (Archived, Approved)] {
            let err = machine.validate(from, to).unwrap_err();
            assert_eq!(err.code, TransitionErrorCode::TransitionDenied, "{from}->{to}");
        }
    }

    #[test]
    fn unlisted_pairs_are_invalid() {
        let machine = LifecycleMachine;
        let err = machine.validate(Deprecated, Draft).unwrap_err();
        assert_eq!(err.code, TransitionErrorCode::InvalidTransition);
        let err = machine.validate(Approved, Draft).unwrap_err();
        assert_eq!(err.code, TransitionErrorCode::InvalidTransition);
    }

    #[test]
    fn allowed_transitions_enumerates_targets() {
        let machine = LifecycleMachine;
        assert_eq!(machine.allowed_transitions(Draft), vec![Approved]);
        let from_archived = machine.allowed_transitions(Archived);
        assert!(from_archived.contains(&Deprecated));
        assert!(from_archived.contains(&Draft));
        assert_eq!(from_archived.len(), 2);
    }

    #[test]
    fn error_codes_serialize_to_wire_literals() {
        let err = LifecycleMachine.validate(Draft, Archived).unwrap_err();
        let body = serde_json::to_value(&err.code).unwrap();
        assert_eq!(body, serde_json::json!("LIFECYCLE_TRANSITION_DENIED"));
    }
}
