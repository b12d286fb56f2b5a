use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::lifecycle::LifecycleState;

pub const DEFAULT_RISK_LEVEL: &str = "medium";

/// Identity of a governed asset within a namespace. The governance layer
/// never inspects the asset's domain content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub namespace: String,
    pub plugin: String,
    pub kind: String,
    pub name: String,
}

impl AssetRef {
    pub fn new(namespace: &str, plugin: &str, kind: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            plugin: plugin.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Stable correlation key shared by versions, bindings, audit, approvals.
    pub fn default_uid(&self) -> String {
        format!("{}:{}:{}", self.plugin, self.kind, self.name)
    }
}

/// Governance overlay for one asset. Created lazily on first access.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceRecord {
    pub id: Uuid,
    pub namespace: String,
    pub plugin: String,
    pub kind: String,
    pub name: String,
    pub asset_uid: String,
    pub owner: Option<String>,
    pub team: Option<String>,
    pub sla: Option<String>,
    pub risk_level: String,
    pub compliance: Option<String>,
    pub intended_use: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub lifecycle_reason: Option<String>,
    pub lifecycle_changed_by: String,
    pub lifecycle_changed_at: DateTime<Utc>,
    pub audit_cadence_days: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial governance document. Only fields present in the request body are
/// applied; everything else is left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernanceOverlay {
    pub owner: Option<String>,
    pub team: Option<String>,
    pub sla: Option<String>,
    pub risk_level: Option<String>,
    pub compliance: Option<String>,
    pub intended_use: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
    pub lifecycle_reason: Option<String>,
    pub audit_cadence_days: Option<i32>,
}

impl GovernanceOverlay {
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
            && self.team.is_none()
            && self.sla.is_none()
            && self.risk_level.is_none()
            && self.compliance.is_none()
            && self.intended_use.is_none()
            && self.lifecycle_state.is_none()
            && self.lifecycle_reason.is_none()
            && self.audit_cadence_days.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayOutcome {
    pub changed: bool,
    pub lifecycle_change: Option<(LifecycleState, LifecycleState)>,
}

/// Copy the overlay's present fields onto the record. A lifecycle change also
/// stamps the change actor and time.
pub fn apply_overlay(
    record: &mut GovernanceRecord,
    overlay: &GovernanceOverlay,
    actor: &str,
    now: DateTime<Utc>,
) -> OverlayOutcome {
    let mut changed = false;
    let mut lifecycle_change = None;

    macro_rules! copy {
        ($field:ident) => {
            if let Some(value) = overlay.$field.clone() {
                record.$field = Some(value);
                changed = true;
            }
        };
    }
    copy!(owner);
    copy!(team);
    copy!(sla);
    copy!(compliance);
    copy!(intended_use);
    copy!(lifecycle_reason);
    if let Some(risk_level) = overlay.risk_level.clone() {
        record.risk_level = risk_level;
        changed = true;
    }
    if let Some(days) = overlay.audit_cadence_days {
        record.audit_cadence_days = Some(days);
        changed = true;
    }
    if let Some(to) = overlay.lifecycle_state {
        if to != record.lifecycle_state {
            lifecycle_change = Some((record.lifecycle_state, to));
            record.lifecycle_state = to;
            record.lifecycle_changed_by = actor.to_string();
            record.lifecycle_changed_at = now;
            changed = true;
        }
    }
    if changed {
        record.updated_at = now;
    }
    OverlayOutcome {
        changed,
        lifecycle_change,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceResponse {
    #[serde(flatten)]
    pub record: GovernanceRecord,
    pub allowed_transitions: Vec<LifecycleState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceRecordList {
    pub records: Vec<GovernanceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}
