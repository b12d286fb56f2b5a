use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "approval_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Canceled,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "canceled" => Some(ApprovalStatus::Canceled),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "approval_verdict", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSelector {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySelector {
    pub plugins: Vec<String>,
    pub kinds: Vec<String>,
    pub risk_levels: Vec<String>,
    pub transitions: Vec<TransitionSelector>,
}

fn default_required_count() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyGate {
    #[serde(default = "default_required_count")]
    pub required_count: i32,
    pub allowed_roles: Vec<String>,
    pub deny_on_first: bool,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self {
            required_count: default_required_count(),
            allowed_roles: Vec::new(),
            deny_on_first: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Declarative approval policy, loaded from the governance settings file and
/// immutable at runtime. Declaration order is evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPolicy {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub selector: PolicySelector,
    #[serde(default)]
    pub gate: PolicyGate,
    #[serde(default)]
    pub expiry_hours: Option<i64>,
}

fn dimension_matches(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|entry| entry == "*" || entry == value)
}

fn transition_matches(
    selectors: &[TransitionSelector],
    from: LifecycleState,
    to: LifecycleState,
) -> bool {
    selectors.is_empty()
        || selectors.iter().any(|selector| {
            (selector.from == "*" || selector.from == from.as_str())
                && (selector.to == "*" || selector.to == to.as_str())
        })
}

/// First enabled policy whose selector matches on every dimension. Empty
/// arrays and `*` are wildcards.
pub fn match_policy<'a>(
    policies: &'a [ApprovalPolicy],
    plugin: &str,
    kind: &str,
    risk_level: &str,
    from: LifecycleState,
    to: LifecycleState,
) -> Option<&'a ApprovalPolicy> {
    policies.iter().find(|policy| {
        policy.enabled
            && dimension_matches(&policy.selector.plugins, plugin)
            && dimension_matches(&policy.selector.kinds, kind)
            && dimension_matches(&policy.selector.risk_levels, risk_level)
            && transition_matches(&policy.selector.transitions, from, to)
    })
}

/// Recompute a request's status from its decision tallies. Denials are
/// considered before quorum so a deny-on-first gate can never be outvoted.
pub fn evaluate_decisions(
    policy: Option<&ApprovalPolicy>,
    approves: i64,
    denies: i64,
) -> ApprovalStatus {
    match policy {
        Some(policy) => {
            if policy.gate.deny_on_first && denies >= 1 {
                ApprovalStatus::Denied
            } else if approves >= i64::from(policy.gate.required_count) {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Pending
            }
        }
        // Unknown policy: any single approval resolves the request.
        None => {
            if approves >= 1 {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Pending
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub namespace: String,
    pub asset_uid: String,
    pub plugin: String,
    pub asset_kind: String,
    pub asset_name: String,
    pub action: String,
    pub action_params: Value,
    pub policy_id: String,
    pub required_count: i32,
    pub status: ApprovalStatus,
    pub requester: String,
    pub reason: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub namespace: String,
    pub asset_uid: String,
    pub plugin: String,
    pub asset_kind: String,
    pub asset_name: String,
    pub action: String,
    pub action_params: Value,
    pub policy_id: String,
    pub required_count: i32,
    pub requester: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub id: Uuid,
    pub request_id: Uuid,
    pub reviewer: String,
    pub verdict: Verdict,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestDetail {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub decisions: Vec<ApprovalDecision>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub verdict: Verdict,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    pub decision: ApprovalStatus,
    pub approves: i64,
    pub denies: i64,
    pub required_count: i32,
    pub auto_executed: bool,
}
