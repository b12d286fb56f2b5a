use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::store as governance_store;
use super::AssetRef;
use crate::approvals::{self, match_policy, NewApprovalRequest};
use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::config::GovernanceSettings;
use crate::error::{AppError, AppResult};
use crate::lifecycle::{LifecycleMachine, LifecycleState};
use crate::promotion::PromotionHandler;
use crate::tenancy::TenantContext;

pub const ACTION_SET_STATE: &str = "lifecycle.setState";

pub const STATUS_OK: &str = "ok";
pub const STATUS_DRY_RUN: &str = "dry-run";
pub const STATUS_PENDING_APPROVAL: &str = "pending-approval";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionBody {
    pub dry_run: bool,
    pub params: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub status: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_count: Option<i32>,
}

impl ActionResult {
    pub fn ok(action: &str, data: Value) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            action: action.to_string(),
            warning: None,
            data: Some(data),
            request_id: None,
            policy_id: None,
            required_count: None,
        }
    }

    pub fn dry_run(action: &str, data: Value) -> Self {
        Self {
            status: STATUS_DRY_RUN.to_string(),
            ..Self::ok(action, data)
        }
    }

    pub fn pending(action: &str, request_id: Uuid, policy_id: &str, required_count: i32) -> Self {
        Self {
            status: STATUS_PENDING_APPROVAL.to_string(),
            action: action.to_string(),
            warning: None,
            data: None,
            request_id: Some(request_id),
            policy_id: Some(policy_id.to_string()),
            required_count: Some(required_count),
        }
    }

    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING_APPROVAL
    }
}

/// Routes an action name to the lifecycle or promotion handler. The sugar
/// actions rewrite their params and run through setState, but keep their own
/// name in the response for client clarity.
#[derive(Clone)]
pub struct ActionDispatcher {
    pub settings: Arc<GovernanceSettings>,
    pub promotion: Option<PromotionHandler>,
}

impl ActionDispatcher {
    pub fn new(settings: Arc<GovernanceSettings>, promotion: Option<PromotionHandler>) -> Self {
        Self {
            settings,
            promotion,
        }
    }

    pub async fn dispatch(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        action: &str,
        body: ActionBody,
    ) -> AppResult<ActionResult> {
        if let Some(lifecycle_action) = action.strip_prefix("lifecycle.") {
            let mut params = if body.params.is_null() {
                json!({})
            } else {
                body.params.clone()
            };
            let object = params
                .as_object_mut()
                .ok_or_else(|| AppError::BadRequest("params must be an object".into()))?;
            match lifecycle_action {
                "setState" => {}
                "deprecate" => {
                    object.insert("state".into(), json!("deprecated"));
                }
                "archive" => {
                    object.insert("state".into(), json!("archived"));
                }
                "restore" => {
                    let target = object
                        .get("targetState")
                        .and_then(Value::as_str)
                        .unwrap_or("deprecated")
                        .to_string();
                    object.insert("state".into(), json!(target));
                }
                other => {
                    return Err(AppError::BadRequest(format!(
                        "unknown action `lifecycle.{other}`"
                    )))
                }
            }
            let mut result = self
                .handle_lifecycle(pool, tenant, asset, &params, body.dry_run)
                .await?;
            result.action = action.to_string();
            return Ok(result);
        }

        if action == crate::promotion::ACTION_VERSION_CREATE || action.starts_with("promotion.") {
            let Some(promotion) = self.promotion.as_ref() else {
                return Err(AppError::NotImplemented(
                    "promotion stores are not wired".into(),
                ));
            };
            return promotion
                .handle(pool, tenant, asset, action, &body.params, body.dry_run)
                .await;
        }

        Err(AppError::BadRequest(format!("unknown action `{action}`")))
    }

    /// Validate, gate, and either divert into the approval engine or execute
    /// the transition directly.
    pub async fn handle_lifecycle(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        let state_raw = params
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("state is required".into()))?;
        let to = LifecycleState::parse(state_raw)
            .ok_or_else(|| AppError::BadRequest(format!("invalid lifecycle state `{state_raw}`")))?;
        let reason = params.get("reason").and_then(Value::as_str);

        let record = governance_store::ensure_exists(pool, asset, None, &tenant.user).await?;
        let from = record.lifecycle_state;
        let transition = LifecycleMachine.validate(from, to)?;

        if transition.noop {
            let data = json!({"lifecycleState": to, "noop": true});
            return Ok(if dry_run {
                ActionResult::dry_run(ACTION_SET_STATE, data)
            } else {
                ActionResult::ok(ACTION_SET_STATE, data)
            });
        }

        let policy = if transition.requires_approval {
            match_policy(
                &self.settings.policies,
                &asset.plugin,
                &asset.kind,
                &record.risk_level,
                from,
                to,
            )
        } else {
            None
        };

        if dry_run {
            return Ok(ActionResult::dry_run(
                ACTION_SET_STATE,
                json!({
                    "from": from,
                    "to": to,
                    "requiresApproval": policy.is_some(),
                }),
            ));
        }

        if let Some(policy) = policy {
            let expires_at = policy
                .expiry_hours
                .map(|hours| Utc::now() + Duration::hours(hours));
            let request = approvals::store::insert_request(
                pool,
                &NewApprovalRequest {
                    namespace: tenant.namespace.clone(),
                    asset_uid: record.asset_uid.clone(),
                    plugin: asset.plugin.clone(),
                    asset_kind: asset.kind.clone(),
                    asset_name: asset.name.clone(),
                    action: ACTION_SET_STATE.to_string(),
                    action_params: json!({"state": to, "reason": reason}),
                    policy_id: policy.id.clone(),
                    required_count: policy.gate.required_count,
                    requester: tenant.user.clone(),
                    reason: reason.map(str::to_string),
                    expires_at,
                },
            )
            .await?;

            let mut event = NewAuditEvent::new(
                &tenant.namespace,
                audit::EVENT_APPROVAL_REQUESTED,
                &tenant.user,
                AuditOutcome::Pending,
            );
            event.correlation_id = Some(request.id.to_string());
            event.asset_uid = Some(record.asset_uid.clone());
            event.action = Some(ACTION_SET_STATE.to_string());
            event.reason = reason.map(str::to_string);
            event.new_value = Some(json!({
                "policyId": policy.id,
                "requiredCount": policy.gate.required_count,
                "from": from,
                "to": to,
            }));
            audit::append_best_effort(pool, &event).await;

            return Ok(ActionResult::pending(
                ACTION_SET_STATE,
                request.id,
                &policy.id,
                policy.gate.required_count,
            ));
        }

        let (previous, updated) = execute_transition(
            pool,
            &tenant.namespace,
            &record.asset_uid,
            to,
            reason,
            &tenant.user,
            None,
        )
        .await?;
        Ok(ActionResult::ok(
            ACTION_SET_STATE,
            json!({
                "lifecycleState": updated.lifecycle_state,
                "previousState": previous,
            }),
        ))
    }
}

/// Apply a lifecycle transition under an exclusive row lock. The state
/// re-read, the update, and the audit append commit together, so transitions
/// on one asset linearize. Used both by the direct path and by deferred
/// execution after approval quorum.
pub async fn execute_transition(
    pool: &PgPool,
    namespace: &str,
    asset_uid: &str,
    to: LifecycleState,
    reason: Option<&str>,
    actor: &str,
    correlation_id: Option<String>,
) -> AppResult<(LifecycleState, super::GovernanceRecord)> {
    let mut tx = pool.begin().await?;

    let record = governance_store::get_by_uid_for_update(&mut *tx, namespace, asset_uid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("governance record `{asset_uid}` not found")))?;
    let from = record.lifecycle_state;
    let transition = LifecycleMachine.validate(from, to)?;
    if transition.noop {
        tx.commit().await?;
        return Ok((from, record));
    }

    let updated =
        governance_store::set_lifecycle(&mut *tx, record.id, to, reason, actor, Utc::now()).await?;

    let mut event = NewAuditEvent::new(namespace, audit::EVENT_LIFECYCLE_CHANGED, actor, AuditOutcome::Success);
    event.correlation_id = correlation_id;
    event.asset_uid = Some(updated.asset_uid.clone());
    event.action = Some(ACTION_SET_STATE.to_string());
    event.reason = reason.map(str::to_string);
    event.old_value = Some(json!({"lifecycleState": from}));
    event.new_value = Some(json!({"lifecycleState": to}));
    audit::append(&mut *tx, &event).await?;

    tx.commit().await?;
    Ok((from, updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_body_defaults_are_permissive() {
        let body: ActionBody = serde_json::from_str("{}").unwrap();
        assert!(!body.dry_run);
        assert!(body.params.is_null());
    }

    #[test]
    fn pending_results_carry_the_gate() {
        let id = Uuid::new_v4();
        let result = ActionResult::pending(ACTION_SET_STATE, id, "high-risk", 2);
        assert!(result.is_pending());
        assert_eq!(result.request_id, Some(id));
        assert_eq!(result.policy_id.as_deref(), Some("high-risk"));
        assert_eq!(result.required_count, Some(2));
    }
}
