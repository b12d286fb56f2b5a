use axum::{
    extract::Extension,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::config;
use crate::pagination::{self, PageQuery};
use crate::tenancy::{self, TenancyMode};

pub const EVENT_API_REQUEST: &str = "governance.api.request";
pub const EVENT_LIFECYCLE_CHANGED: &str = "governance.lifecycle.changed";
pub const EVENT_RECORD_UPDATED: &str = "governance.record.updated";
pub const EVENT_RECORD_DELETED: &str = "governance.record.deleted";
pub const EVENT_VERSION_CREATED: &str = "governance.version.created";
pub const EVENT_PROMOTION_BOUND: &str = "governance.promotion.bound";
pub const EVENT_PROMOTION_PROMOTED: &str = "governance.promotion.promoted";
pub const EVENT_PROMOTION_ROLLBACK: &str = "governance.promotion.rollback";
pub const EVENT_APPROVAL_REQUESTED: &str = "governance.approval.requested";
pub const EVENT_APPROVAL_DECISION: &str = "governance.approval.decision";
pub const EVENT_APPROVAL_DENIED: &str = "governance.approval.denied";
pub const EVENT_APPROVAL_CANCELED: &str = "governance.approval.canceled";
pub const EVENT_APPROVAL_EXPIRED: &str = "governance.approval.expired";
pub const EVENT_APPROVAL_EXECUTION_FAILED: &str = "governance.approval.execution_failed";
pub const EVENT_REFRESH_REQUESTED: &str = "governance.refresh.requested";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Pending,
    Canceled,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Pending => "pending",
            AuditOutcome::Canceled => "canceled",
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => AuditOutcome::Success,
            403 => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }
}

/// Append-only audit record. Rows are never updated; retention pruning is the
/// only delete path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub namespace: String,
    pub correlation_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub asset_uid: Option<String>,
    pub version_id: Option<String>,
    pub action: Option<String>,
    pub outcome: String,
    pub reason: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub plugin: Option<String>,
    pub resource_type: Option<String>,
    pub action_verb: Option<String>,
    pub status_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuditEvent {
    pub namespace: String,
    pub correlation_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub asset_uid: Option<String>,
    pub version_id: Option<String>,
    pub action: Option<String>,
    pub outcome: &'static str,
    pub reason: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub plugin: Option<String>,
    pub resource_type: Option<String>,
    pub action_verb: Option<String>,
    pub status_code: Option<i32>,
}

impl NewAuditEvent {
    pub fn new(namespace: &str, event_type: &str, actor: &str, outcome: AuditOutcome) -> Self {
        Self {
            namespace: namespace.to_string(),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            outcome: outcome.as_str(),
            ..Default::default()
        }
    }
}

pub async fn append<'c, E>(executor: E, event: &NewAuditEvent) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_events (
            namespace, correlation_id, event_type, actor, asset_uid, version_id,
            action, outcome, reason, old_value, new_value, plugin, resource_type,
            action_verb, status_code
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(&event.namespace)
    .bind(&event.correlation_id)
    .bind(&event.event_type)
    .bind(&event.actor)
    .bind(&event.asset_uid)
    .bind(&event.version_id)
    .bind(&event.action)
    .bind(event.outcome)
    .bind(&event.reason)
    .bind(&event.old_value)
    .bind(&event.new_value)
    .bind(&event.plugin)
    .bind(&event.resource_type)
    .bind(&event.action_verb)
    .bind(event.status_code)
    .execute(executor)
    .await?;
    Ok(())
}

/// Audit writes never fail the request they describe.
pub async fn append_best_effort(pool: &PgPool, event: &NewAuditEvent) {
    if let Err(err) = append(pool, event).await {
        tracing::warn!(?err, event_type = %event.event_type, "audit append failed");
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub namespace: Option<String>,
    pub actor: Option<String>,
    pub plugin: Option<String>,
    pub event_type: Option<String>,
    pub asset_uid: Option<String>,
    pub outcome: Option<String>,
}

const AUDIT_COLUMNS: &str = "id, namespace, correlation_id, event_type, actor, asset_uid, \
     version_id, action, outcome, reason, old_value, new_value, plugin, resource_type, \
     action_verb, status_code, created_at";

pub async fn list_by_asset(
    pool: &PgPool,
    namespace: &str,
    asset_uid: &str,
    page_size: i64,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<AuditEvent>, sqlx::Error> {
    let filter = AuditFilter {
        namespace: Some(namespace.to_string()),
        asset_uid: Some(asset_uid.to_string()),
        ..Default::default()
    };
    list_filtered(pool, &filter, page_size, before).await
}

pub async fn list_filtered(
    pool: &PgPool,
    filter: &AuditFilter,
    page_size: i64,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<AuditEvent>, sqlx::Error> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {AUDIT_COLUMNS} FROM audit_events WHERE TRUE"
    ));
    if let Some(namespace) = filter.namespace.as_ref() {
        builder.push(" AND namespace = ");
        builder.push_bind(namespace);
    }
    if let Some(actor) = filter.actor.as_ref() {
        builder.push(" AND actor = ");
        builder.push_bind(actor);
    }
    if let Some(plugin) = filter.plugin.as_ref() {
        builder.push(" AND plugin = ");
        builder.push_bind(plugin);
    }
    if let Some(event_type) = filter.event_type.as_ref() {
        builder.push(" AND event_type = ");
        builder.push_bind(event_type);
    }
    if let Some(asset_uid) = filter.asset_uid.as_ref() {
        builder.push(" AND asset_uid = ");
        builder.push_bind(asset_uid);
    }
    if let Some(outcome) = filter.outcome.as_ref() {
        builder.push(" AND outcome = ");
        builder.push_bind(outcome);
    }
    if let Some(before) = before {
        builder.push(" AND created_at < ");
        builder.push_bind(before);
    }
    builder.push(" ORDER BY created_at DESC LIMIT ");
    builder.push_bind(page_size);

    builder.build_query_as::<AuditEvent>().fetch_all(pool).await
}

/// Retention pruning. Returns the number of events removed.
pub async fn delete_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM audit_events WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Shared paging shape for audit listings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEventList {
    pub events: Vec<AuditEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

pub fn paged(events: Vec<AuditEvent>, page_size: i64) -> AuditEventList {
    let next_page_token = if events.len() as i64 == page_size {
        events.last().map(|event| pagination::time_token(event.created_at))
    } else {
        None
    };
    AuditEventList {
        events,
        next_page_token,
    }
}

pub fn page_window(query: &PageQuery) -> Result<(i64, Option<DateTime<Utc>>), crate::error::AppError> {
    let page_size = pagination::clamp_page_size(query.page_size);
    let before = pagination::parse_time_token(query.page_token.as_deref())?;
    Ok((page_size, before))
}

/// Derive the plugin and action verb recorded for a mutating request.
/// Management routes carry the plugin in an `/api/<plugin>_catalog/` prefix;
/// governance routes carry it in the asset path.
pub fn derive_audit_parts(path: &str) -> (Option<String>, Option<String>) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let action_verb = segments.last().map(|s| s.to_string());
    let plugin = if let Some(catalog) = segments.get(1).and_then(|s| s.strip_suffix("_catalog")) {
        if segments.first() == Some(&"api") {
            Some(catalog.to_string())
        } else {
            None
        }
    } else {
        segments
            .iter()
            .position(|s| *s == "assets")
            .and_then(|idx| segments.get(idx + 1))
            .map(|s| s.to_string())
    };
    (plugin, action_verb)
}

/// Wraps mutating handlers; captures the response code and persists one event
/// per request. Pass-through when auditing is disabled.
pub async fn audit_middleware<B>(
    Extension(pool): Extension<PgPool>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let (actor, _groups) = tenancy::identity_from_headers(request.headers());
    let namespace = tenancy::resolve_namespace(
        TenancyMode::from_env(),
        query.as_deref(),
        request.headers(),
    )
    .unwrap_or_else(|_| tenancy::DEFAULT_NAMESPACE.to_string());

    let response = next.run(request).await;

    if method == Method::GET || !*config::AUDIT_ENABLED {
        return response;
    }
    let status = response.status().as_u16();
    let outcome = AuditOutcome::from_status(status);
    if outcome == AuditOutcome::Denied && !*config::AUDIT_LOG_DENIED {
        return response;
    }

    let (plugin, action_verb) = derive_audit_parts(&path);
    let mut event = NewAuditEvent::new(&namespace, EVENT_API_REQUEST, &actor, outcome);
    event.action = Some(format!("{method} {path}"));
    event.plugin = plugin;
    event.action_verb = action_verb;
    event.resource_type = crate::authz::resource_verb(&method, &path)
        .map(|(resource, _)| resource.to_string());
    event.status_code = Some(i32::from(status));
    append_best_effort(&pool, &event).await;

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_classification_follows_status() {
        assert_eq!(AuditOutcome::from_status(200), AuditOutcome::Success);
        assert_eq!(AuditOutcome::from_status(202), AuditOutcome::Success);
        assert_eq!(AuditOutcome::from_status(403), AuditOutcome::Denied);
        assert_eq!(AuditOutcome::from_status(400), AuditOutcome::Failure);
        assert_eq!(AuditOutcome::from_status(500), AuditOutcome::Failure);
    }

    #[test]
    fn catalog_prefix_yields_plugin() {
        let (plugin, verb) = derive_audit_parts("/api/mcp_catalog/sources/reload");
        assert_eq!(plugin.as_deref(), Some("mcp"));
        assert_eq!(verb.as_deref(), Some("reload"));
    }

    #[test]
    fn governance_asset_path_yields_plugin() {
        let (plugin, verb) = derive_audit_parts(
            "/api/governance/v1alpha1/assets/huggingface/model/bert/actions/lifecycle.archive",
        );
        assert_eq!(plugin.as_deref(), Some("huggingface"));
        assert_eq!(verb.as_deref(), Some("lifecycle.archive"));
    }

    #[test]
    fn paging_token_only_on_full_pages() {
        let list = paged(Vec::new(), 20);
        assert!(list.next_page_token.is_none());
    }
}
