use axum::{
    extract::{Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    evaluate_decisions, ApprovalRequest, ApprovalRequestDetail, ApprovalStatus, CancelBody,
    DecisionBody, DecisionResult, Verdict,
};
use super::store;
use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::error::{AppError, AppResult};
use crate::governance::{execute_transition, ActionDispatcher};
use crate::lifecycle::LifecycleState;
use crate::pagination;
use crate::tenancy::TenantContext;

pub fn routes() -> Router {
    Router::new()
        .route("/approvals", get(list_approvals))
        .route("/approvals/:id", get(get_approval))
        .route("/approvals/:id/decisions", post(decide))
        .route("/approvals/:id/cancel", post(cancel))
        .route("/policies", get(list_policies))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ApprovalListQuery {
    status: Option<String>,
    asset_uid: Option<String>,
    page_size: Option<i64>,
    page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequestList {
    requests: Vec<ApprovalRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

async fn list_approvals(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Query(query): Query<ApprovalListQuery>,
) -> AppResult<Json<ApprovalRequestList>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ApprovalStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("invalid status `{raw}`")))
        })
        .transpose()?;
    let page_size = pagination::clamp_page_size(query.page_size);
    let before = pagination::parse_time_token(query.page_token.as_deref())?;

    let requests = store::list_requests(
        &pool,
        &tenant.namespace,
        status,
        query.asset_uid.as_deref(),
        page_size,
        before,
    )
    .await?;
    let next_page_token = if requests.len() as i64 == page_size {
        requests
            .last()
            .map(|request| pagination::time_token(request.created_at))
    } else {
        None
    };
    Ok(Json(ApprovalRequestList {
        requests,
        next_page_token,
    }))
}

async fn get_approval(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApprovalRequestDetail>> {
    let request = store::get_request(&pool, &tenant.namespace, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("approval request `{id}` not found")))?;
    let decisions = store::list_decisions(&pool, id).await?;
    Ok(Json(ApprovalRequestDetail { request, decisions }))
}

async fn decide(
    Extension(pool): Extension<PgPool>,
    Extension(dispatcher): Extension<ActionDispatcher>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> AppResult<Json<DecisionResult>> {
    let mut tx = pool.begin().await?;
    let request = store::get_request_for_update(&mut *tx, &tenant.namespace, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("approval request `{id}` not found")))?;
    if request.status.is_terminal() {
        return Err(AppError::Conflict(
            "approval request is no longer pending".into(),
        ));
    }

    let policy = dispatcher
        .settings
        .policies
        .iter()
        .find(|policy| policy.id == request.policy_id);

    if let Some(policy) = policy {
        if !policy.gate.allowed_roles.is_empty()
            && !tenant
                .groups
                .iter()
                .any(|group| policy.gate.allowed_roles.contains(group))
        {
            return Err(AppError::ForbiddenMsg(
                "reviewer is not in a role permitted by the policy".into(),
            ));
        }
    }
    if body.verdict == Verdict::Approve && request.requester == tenant.user {
        return Err(AppError::ForbiddenMsg(
            "requester cannot approve their own request".into(),
        ));
    }
    if store::reviewer_has_decided(&mut *tx, id, &tenant.user).await? {
        return Err(AppError::Conflict(
            "reviewer has already decided on this request".into(),
        ));
    }

    store::insert_decision(&mut *tx, id, &tenant.user, body.verdict, body.comment.as_deref())
        .await?;
    let (approves, denies) = store::decision_counts(&mut *tx, id).await?;
    let outcome = evaluate_decisions(policy, approves, denies);

    let result = DecisionResult {
        decision: outcome,
        approves,
        denies,
        required_count: request.required_count,
        auto_executed: false,
    };

    match outcome {
        ApprovalStatus::Pending => {
            tx.commit().await?;
            record_decision_event(&pool, &tenant, &request, body.verdict, approves, denies, outcome)
                .await;
            Ok(Json(result))
        }
        ApprovalStatus::Denied => {
            store::resolve(
                &mut *tx,
                id,
                ApprovalStatus::Denied,
                &tenant.user,
                Some("denied by reviewer"),
            )
            .await?;
            tx.commit().await?;
            record_decision_event(&pool, &tenant, &request, body.verdict, approves, denies, outcome)
                .await;
            let mut event = NewAuditEvent::new(
                &tenant.namespace,
                audit::EVENT_APPROVAL_DENIED,
                &tenant.user,
                AuditOutcome::Denied,
            );
            event.correlation_id = Some(request.id.to_string());
            event.asset_uid = Some(request.asset_uid.clone());
            event.action = Some(request.action.clone());
            audit::append_best_effort(&pool, &event).await;
            Ok(Json(result))
        }
        ApprovalStatus::Approved => {
            store::resolve(
                &mut *tx,
                id,
                ApprovalStatus::Approved,
                &tenant.user,
                Some("threshold met"),
            )
            .await?;
            tx.commit().await?;
            record_decision_event(&pool, &tenant, &request, body.verdict, approves, denies, outcome)
                .await;

            match execute_approved_action(&pool, &tenant, &request).await {
                Ok(()) => Ok(Json(DecisionResult {
                    auto_executed: true,
                    ..result
                })),
                Err(err) => {
                    let mut event = NewAuditEvent::new(
                        &tenant.namespace,
                        audit::EVENT_APPROVAL_EXECUTION_FAILED,
                        &tenant.user,
                        AuditOutcome::Failure,
                    );
                    event.correlation_id = Some(request.id.to_string());
                    event.asset_uid = Some(request.asset_uid.clone());
                    event.action = Some(request.action.clone());
                    event.reason = Some(err.to_string());
                    audit::append_best_effort(&pool, &event).await;
                    Err(AppError::Internal(format!(
                        "approved action execution failed: {err}"
                    )))
                }
            }
        }
        ApprovalStatus::Canceled | ApprovalStatus::Expired => unreachable!(),
    }
}

async fn record_decision_event(
    pool: &PgPool,
    tenant: &TenantContext,
    request: &ApprovalRequest,
    verdict: Verdict,
    approves: i64,
    denies: i64,
    outcome: ApprovalStatus,
) {
    let mut event = NewAuditEvent::new(
        &tenant.namespace,
        audit::EVENT_APPROVAL_DECISION,
        &tenant.user,
        AuditOutcome::Success,
    );
    event.correlation_id = Some(request.id.to_string());
    event.asset_uid = Some(request.asset_uid.clone());
    event.action = Some(request.action.clone());
    event.new_value = Some(json!({
        "verdict": verdict,
        "approves": approves,
        "denies": denies,
        "status": outcome,
    }));
    audit::append_best_effort(pool, &event).await;
}

/// Deferred execution of the stored action after quorum. Runs under the
/// governance row lock; any failure leaves the request approved and is
/// surfaced to the decision caller as a failure.
async fn execute_approved_action(
    pool: &PgPool,
    tenant: &TenantContext,
    request: &ApprovalRequest,
) -> AppResult<()> {
    match request.action.as_str() {
        "lifecycle.setState" => {
            let state_raw = request
                .action_params
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::Internal("stored action params missing state".into()))?;
            let to = LifecycleState::parse(state_raw).ok_or_else(|| {
                AppError::Internal(format!("stored action params carry invalid state `{state_raw}`"))
            })?;
            let reason = request.action_params.get("reason").and_then(Value::as_str);
            execute_transition(
                pool,
                &request.namespace,
                &request.asset_uid,
                to,
                reason,
                &tenant.user,
                Some(request.id.to_string()),
            )
            .await?;
            Ok(())
        }
        other => Err(AppError::Internal(format!(
            "unsupported deferred action `{other}`"
        ))),
    }
}

async fn cancel(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> AppResult<Json<Value>> {
    let reason = body.and_then(|Json(body)| body.reason);
    let mut tx = pool.begin().await?;
    let request = store::get_request_for_update(&mut *tx, &tenant.namespace, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("approval request `{id}` not found")))?;
    if request.status.is_terminal() {
        return Err(AppError::Conflict("approval request is not pending".into()));
    }
    store::resolve(
        &mut *tx,
        id,
        ApprovalStatus::Canceled,
        &tenant.user,
        reason.as_deref(),
    )
    .await?;
    tx.commit().await?;

    let mut event = NewAuditEvent::new(
        &tenant.namespace,
        audit::EVENT_APPROVAL_CANCELED,
        &tenant.user,
        AuditOutcome::Canceled,
    );
    event.correlation_id = Some(request.id.to_string());
    event.asset_uid = Some(request.asset_uid.clone());
    event.action = Some(request.action.clone());
    event.reason = reason;
    audit::append_best_effort(&pool, &event).await;

    Ok(Json(json!({"status": "canceled"})))
}

async fn list_policies(
    Extension(dispatcher): Extension<ActionDispatcher>,
) -> AppResult<Json<Value>> {
    Ok(Json(json!({"policies": dispatcher.settings.policies})))
}
