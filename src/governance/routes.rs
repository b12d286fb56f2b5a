use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::actions::{ActionBody, ActionDispatcher};
use super::models::{
    apply_overlay, AssetRef, GovernanceOverlay, GovernanceRecordList, GovernanceResponse,
};
use super::store;
use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::error::{AppError, AppResult};
use crate::lifecycle::LifecycleMachine;
use crate::pagination::{self, PageQuery};
use crate::tenancy::TenantContext;
use crate::versions::{self, VersionListResponse};
use crate::{bindings, promotion};

pub fn routes() -> Router {
    Router::new()
        .route("/assets", get(list_assets))
        .route(
            "/assets/:plugin/:kind/:name",
            get(get_asset).patch(patch_asset).delete(delete_asset),
        )
        .route("/assets/:plugin/:kind/:name/history", get(asset_history))
        .route(
            "/assets/:plugin/:kind/:name/actions/:action",
            post(execute_action),
        )
        .route(
            "/assets/:plugin/:kind/:name/versions",
            get(list_versions).post(create_version),
        )
        .route("/assets/:plugin/:kind/:name/bindings", get(list_bindings))
        .route("/assets/:plugin/:kind/:name/bindings/:env", put(put_binding))
}

fn respond(record: super::GovernanceRecord) -> GovernanceResponse {
    let allowed_transitions = LifecycleMachine.allowed_transitions(record.lifecycle_state);
    GovernanceResponse {
        record,
        allowed_transitions,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AssetListQuery {
    plugin: Option<String>,
    page_size: Option<i64>,
    page_token: Option<String>,
}

async fn list_assets(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Query(query): Query<AssetListQuery>,
) -> AppResult<Json<GovernanceRecordList>> {
    let page_size = pagination::clamp_page_size(query.page_size);
    let after = query
        .page_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .map(|token| {
            Uuid::parse_str(token)
                .map_err(|_| AppError::BadRequest(format!("invalid page token `{token}`")))
        })
        .transpose()?;
    let records = store::list(
        &pool,
        &tenant.namespace,
        query.plugin.as_deref(),
        page_size,
        after,
    )
    .await?;
    let next_page_token = if records.len() as i64 == page_size {
        records.last().map(|record| record.id.to_string())
    } else {
        None
    };
    Ok(Json(GovernanceRecordList {
        records,
        next_page_token,
    }))
}

async fn get_asset(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
) -> AppResult<Json<GovernanceResponse>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let record = store::ensure_exists(&pool, &asset, None, &tenant.user).await?;
    Ok(Json(respond(record)))
}

async fn patch_asset(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
    Json(overlay): Json<GovernanceOverlay>,
) -> AppResult<Json<GovernanceResponse>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let mut record = store::ensure_exists(&pool, &asset, None, &tenant.user).await?;
    let outcome = apply_overlay(&mut record, &overlay, &tenant.user, chrono::Utc::now());
    if !outcome.changed {
        return Ok(Json(respond(record)));
    }
    let record = store::upsert(&pool, &record).await?;

    let mut event = NewAuditEvent::new(
        &tenant.namespace,
        audit::EVENT_RECORD_UPDATED,
        &tenant.user,
        AuditOutcome::Success,
    );
    event.asset_uid = Some(record.asset_uid.clone());
    event.plugin = Some(plugin.clone());
    event.new_value = serde_json::to_value(&record).ok();
    audit::append_best_effort(&pool, &event).await;

    if let Some((from, to)) = outcome.lifecycle_change {
        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_LIFECYCLE_CHANGED,
            &tenant.user,
            AuditOutcome::Success,
        );
        event.asset_uid = Some(record.asset_uid.clone());
        event.plugin = Some(plugin);
        event.old_value = Some(json!({"lifecycleState": from}));
        event.new_value = Some(json!({"lifecycleState": to}));
        audit::append_best_effort(&pool, &event).await;
    }

    Ok(Json(respond(record)))
}

async fn delete_asset(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
) -> AppResult<Json<Value>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let existing = store::get(&pool, &asset).await?;
    let Some(existing) = existing else {
        return Err(AppError::NotFound(format!(
            "governance record for `{plugin}/{kind}/{name}` not found"
        )));
    };
    store::delete(&pool, &asset).await?;

    let mut event = NewAuditEvent::new(
        &tenant.namespace,
        audit::EVENT_RECORD_DELETED,
        &tenant.user,
        AuditOutcome::Success,
    );
    event.asset_uid = Some(existing.asset_uid.clone());
    event.plugin = Some(plugin);
    event.old_value = serde_json::to_value(&existing).ok();
    audit::append_best_effort(&pool, &event).await;

    Ok(Json(json!({"status": "deleted"})))
}

async fn asset_history(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<audit::AuditEventList>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let record = store::ensure_exists(&pool, &asset, None, &tenant.user).await?;
    let (page_size, before) = audit::page_window(&query)?;
    let events =
        audit::list_by_asset(&pool, &tenant.namespace, &record.asset_uid, page_size, before)
            .await?;
    Ok(Json(audit::paged(events, page_size)))
}

async fn execute_action(
    Extension(pool): Extension<PgPool>,
    Extension(dispatcher): Extension<ActionDispatcher>,
    tenant: TenantContext,
    Path((plugin, kind, name, action)): Path<(String, String, String, String)>,
    body: Option<Json<ActionBody>>,
) -> AppResult<(StatusCode, Json<super::ActionResult>)> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let result = dispatcher
        .dispatch(&pool, &tenant, &asset, &action, body)
        .await?;
    let status = if result.is_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

async fn list_versions(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<VersionListResponse>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let record = store::ensure_exists(&pool, &asset, None, &tenant.user).await?;
    let page_size = pagination::clamp_page_size(query.page_size);
    let before = pagination::parse_time_token(query.page_token.as_deref())?;
    let (records, total_size) = versions::list(
        &pool,
        &tenant.namespace,
        &record.asset_uid,
        page_size,
        before,
    )
    .await?;
    let next_page_token = if records.len() as i64 == page_size {
        records
            .last()
            .map(|version| pagination::time_token(version.created_at))
    } else {
        None
    };
    Ok(Json(VersionListResponse {
        versions: records,
        next_page_token,
        total_size,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVersionBody {
    version_label: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn create_version(
    Extension(pool): Extension<PgPool>,
    Extension(dispatcher): Extension<ActionDispatcher>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
    Json(body): Json<CreateVersionBody>,
) -> AppResult<(StatusCode, Json<super::ActionResult>)> {
    let Some(promotion) = dispatcher.promotion.as_ref() else {
        return Err(AppError::NotImplemented("promotion stores are not wired".into()));
    };
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let params = json!({
        "versionLabel": body.version_label,
        "reason": body.reason,
    });
    let result = promotion
        .version_create(&pool, &tenant, &asset, &params, false)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn list_bindings(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path((plugin, kind, name)): Path<(String, String, String)>,
) -> AppResult<Json<bindings::BindingsResponse>> {
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let rows = bindings::list(&pool, &asset).await?;
    Ok(Json(bindings::BindingsResponse { bindings: rows }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutBindingBody {
    version_id: Option<String>,
}

async fn put_binding(
    Extension(pool): Extension<PgPool>,
    Extension(dispatcher): Extension<ActionDispatcher>,
    tenant: TenantContext,
    Path((plugin, kind, name, env)): Path<(String, String, String, String)>,
    Json(body): Json<PutBindingBody>,
) -> AppResult<Json<Value>> {
    let Some(promotion_handler) = dispatcher.promotion.as_ref() else {
        return Err(AppError::NotImplemented("promotion stores are not wired".into()));
    };
    let asset = AssetRef::new(&tenant.namespace, &plugin, &kind, &name);
    let params = json!({
        "environment": env,
        "versionId": body.version_id,
    });
    let result = promotion_handler
        .handle(&pool, &tenant, &asset, promotion::ACTION_BIND, &params, false)
        .await?;
    let warnings: Vec<String> = result.warning.clone().into_iter().collect();
    Ok(Json(json!({
        "binding": result.data,
        "warnings": warnings,
    })))
}
