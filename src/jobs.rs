use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get as get_route, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, QueryBuilder};
use tokio::time;
use uuid::Uuid;

use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::pagination;
use crate::tenancy::TenantContext;

const WORKER_POLL_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "refresh_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RefreshJobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RefreshJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshJobState::Succeeded | RefreshJobState::Failed | RefreshJobState::Canceled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RefreshJobState::Queued),
            "running" => Some(RefreshJobState::Running),
            "succeeded" => Some(RefreshJobState::Succeeded),
            "failed" => Some(RefreshJobState::Failed),
            "canceled" => Some(RefreshJobState::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RefreshJob {
    pub id: Uuid,
    pub namespace: String,
    pub plugin: String,
    pub source_id: String,
    pub idempotency_key: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub state: RefreshJobState,
    pub attempt_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entities_loaded: i64,
    pub entities_removed: i64,
    pub duration_ms: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRefreshJob {
    pub namespace: String,
    pub plugin: String,
    pub source_id: String,
    pub idempotency_key: String,
    pub requested_by: String,
}

const JOB_COLUMNS: &str = "id, namespace, plugin, source_id, idempotency_key, requested_by, \
     requested_at, state, attempt_count, started_at, finished_at, entities_loaded, \
     entities_removed, duration_ms, last_error";

/// Idempotent enqueue. A partial unique index over non-terminal states makes
/// the insert race-safe: concurrent enqueues with one key converge on a
/// single queued row, and the losers read the winner back.
pub async fn enqueue(pool: &PgPool, input: &NewRefreshJob) -> Result<(RefreshJob, bool), sqlx::Error> {
    let inserted = sqlx::query_as::<_, RefreshJob>(&format!(
        r#"
        INSERT INTO refresh_jobs (namespace, plugin, source_id, idempotency_key, requested_by)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (idempotency_key) WHERE state IN ('queued', 'running') DO NOTHING
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(&input.namespace)
    .bind(&input.plugin)
    .bind(&input.source_id)
    .bind(&input.idempotency_key)
    .bind(&input.requested_by)
    .fetch_optional(pool)
    .await?;

    if let Some(job) = inserted {
        return Ok((job, true));
    }
    let existing = sqlx::query_as::<_, RefreshJob>(&format!(
        r#"
        SELECT {JOB_COLUMNS} FROM refresh_jobs
        WHERE idempotency_key = $1 AND state IN ('queued', 'running')
        ORDER BY requested_at
        LIMIT 1
        "#
    ))
    .bind(&input.idempotency_key)
    .fetch_optional(pool)
    .await?;
    match existing {
        Some(job) => Ok((job, false)),
        // Raced a completion between insert and read; retry once.
        None => {
            let job = sqlx::query_as::<_, RefreshJob>(&format!(
                r#"
                INSERT INTO refresh_jobs (namespace, plugin, source_id, idempotency_key, requested_by)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(&input.namespace)
            .bind(&input.plugin)
            .bind(&input.source_id)
            .bind(&input.idempotency_key)
            .bind(&input.requested_by)
            .fetch_one(pool)
            .await?;
            Ok((job, true))
        }
    }
}

/// Claim the oldest queued job below the attempt cap. Skip-locked semantics
/// guarantee exactly one claimer wins each job under concurrency.
pub async fn claim(pool: &PgPool, max_attempts: i32) -> Result<Option<RefreshJob>, sqlx::Error> {
    sqlx::query_as::<_, RefreshJob>(&format!(
        r#"
        UPDATE refresh_jobs
        SET state = 'running', started_at = NOW(), attempt_count = attempt_count + 1
        WHERE id = (
            SELECT id FROM refresh_jobs
            WHERE state = 'queued' AND attempt_count < $1
            ORDER BY requested_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(max_attempts)
    .fetch_optional(pool)
    .await
}

pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    entities_loaded: i64,
    entities_removed: i64,
    duration_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE refresh_jobs
        SET state = 'succeeded', finished_at = NOW(), entities_loaded = $2,
            entities_removed = $3, duration_ms = $4, last_error = NULL
        WHERE id = $1 AND state = 'running'
        "#,
    )
    .bind(id)
    .bind(entities_loaded)
    .bind(entities_removed)
    .bind(duration_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Failed attempts requeue until the cap, then the job goes terminally
/// failed. The last error is preserved either way.
pub async fn fail(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    max_attempts: i32,
) -> Result<Option<RefreshJobState>, sqlx::Error> {
    let state: Option<RefreshJobState> = sqlx::query_scalar(
        r#"
        UPDATE refresh_jobs
        SET state = CASE WHEN attempt_count < $3
                THEN 'queued'::refresh_job_state
                ELSE 'failed'::refresh_job_state
            END,
            last_error = $2,
            started_at = NULL,
            finished_at = CASE WHEN attempt_count < $3 THEN NULL ELSE NOW() END
        WHERE id = $1 AND state = 'running'
        RETURNING state
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(max_attempts)
    .fetch_optional(pool)
    .await?;
    Ok(state)
}

/// Queued jobs only; running jobs need cooperative cancellation.
pub async fn cancel(pool: &PgPool, namespace: &str, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE refresh_jobs
        SET state = 'canceled', finished_at = NOW()
        WHERE id = $1 AND namespace = $2 AND state = 'queued'
        "#,
    )
    .bind(id)
    .bind(namespace)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Requeue running jobs whose claimer died. Leader-only sweep.
pub async fn cleanup_stuck(pool: &PgPool, ttl: Duration) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - ttl;
    let result = sqlx::query(
        r#"
        UPDATE refresh_jobs
        SET state = 'queued', started_at = NULL,
            last_error = COALESCE(last_error, 'requeued after stuck-job recovery')
        WHERE state = 'running' AND started_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn get(pool: &PgPool, namespace: &str, id: Uuid) -> Result<Option<RefreshJob>, sqlx::Error> {
    sqlx::query_as::<_, RefreshJob>(&format!(
        "SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE namespace = $1 AND id = $2"
    ))
    .bind(namespace)
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list(
    pool: &PgPool,
    namespace: &str,
    state: Option<RefreshJobState>,
    plugin: Option<&str>,
    page_size: i64,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<RefreshJob>, sqlx::Error> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE namespace = "
    ));
    builder.push_bind(namespace);
    if let Some(state) = state {
        builder.push(" AND state = ");
        builder.push_bind(state);
    }
    if let Some(plugin) = plugin {
        builder.push(" AND plugin = ");
        builder.push_bind(plugin);
    }
    if let Some(before) = before {
        builder.push(" AND requested_at < ");
        builder.push_bind(before);
    }
    builder.push(" ORDER BY requested_at DESC LIMIT ");
    builder.push_bind(page_size);
    builder.build_query_as::<RefreshJob>().fetch_all(pool).await
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOutcome {
    pub entities_loaded: i64,
    pub entities_removed: i64,
}

/// Per-plugin ingest seam. The governance core ships a no-op runner; real
/// ingestors are wired by the catalog plugins.
#[async_trait]
pub trait RefreshRunner: Send + Sync {
    async fn run(&self, job: &RefreshJob) -> anyhow::Result<RefreshOutcome>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunner;

#[async_trait]
impl RefreshRunner for NoopRunner {
    async fn run(&self, _job: &RefreshJob) -> anyhow::Result<RefreshOutcome> {
        Ok(RefreshOutcome::default())
    }
}

/// Poll-claim-execute worker. Claims are contended across replicas; the
/// skip-locked claim keeps each job on exactly one worker.
pub fn start_worker(pool: PgPool, runner: Arc<dyn RefreshRunner>) {
    tokio::spawn(async move {
        let mut ticker = time::interval(StdDuration::from_secs(WORKER_POLL_SECS));
        loop {
            ticker.tick().await;
            loop {
                let claimed = match claim(&pool, *config::REFRESH_MAX_ATTEMPTS).await {
                    Ok(job) => job,
                    Err(err) => {
                        tracing::warn!(?err, "refresh job claim failed");
                        break;
                    }
                };
                let Some(job) = claimed else { break };
                let started = Instant::now();
                match runner.run(&job).await {
                    Ok(outcome) => {
                        let duration_ms = started.elapsed().as_millis() as i64;
                        if let Err(err) = complete(
                            &pool,
                            job.id,
                            outcome.entities_loaded,
                            outcome.entities_removed,
                            duration_ms,
                        )
                        .await
                        {
                            tracing::warn!(?err, job_id = %job.id, "refresh job completion failed");
                        } else {
                            tracing::info!(job_id = %job.id, plugin = %job.plugin, "refresh job completed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, job_id = %job.id, "refresh job failed");
                        if let Err(store_err) =
                            fail(&pool, job.id, &err.to_string(), *config::REFRESH_MAX_ATTEMPTS).await
                        {
                            tracing::warn!(?store_err, job_id = %job.id, "refresh job failure update failed");
                        }
                    }
                }
            }
        }
    });
}

/// Marker for whether the deployment runs an async job queue at all.
#[derive(Debug, Clone, Copy)]
pub struct RefreshQueue {
    pub enabled: bool,
}

pub fn routes() -> Router {
    Router::new()
        .route("/refresh", post(request_refresh))
        .route("/jobs", get_route(list_jobs))
        .route("/jobs/:id", get_route(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    plugin: Option<String>,
    source_id: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn request_refresh(
    Extension(pool): Extension<PgPool>,
    Extension(queue): Extension<RefreshQueue>,
    tenant: TenantContext,
    Json(body): Json<RefreshBody>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let plugin = body
        .plugin
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest("plugin is required".into()))?;
    let source_id = body
        .source_id
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest("sourceId is required".into()))?;

    if !queue.enabled {
        return Ok((StatusCode::OK, Json(json!({"status": "completed"}))));
    }

    let idempotency_key = body
        .idempotency_key
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("{}:{}:{}", tenant.namespace, plugin, source_id));
    let (job, created) = enqueue(
        &pool,
        &NewRefreshJob {
            namespace: tenant.namespace.clone(),
            plugin: plugin.clone(),
            source_id,
            idempotency_key,
            requested_by: tenant.user.clone(),
        },
    )
    .await?;

    if created {
        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_REFRESH_REQUESTED,
            &tenant.user,
            AuditOutcome::Pending,
        );
        event.correlation_id = Some(job.id.to_string());
        event.plugin = Some(plugin);
        event.new_value = Some(json!({"jobId": job.id, "sourceId": job.source_id}));
        audit::append_best_effort(&pool, &event).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "queued", "jobId": job.id})),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JobListQuery {
    state: Option<String>,
    plugin: Option<String>,
    page_size: Option<i64>,
    page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobList {
    jobs: Vec<RefreshJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

async fn list_jobs(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Query(query): Query<JobListQuery>,
) -> AppResult<Json<JobList>> {
    let state = query
        .state
        .as_deref()
        .map(|raw| {
            RefreshJobState::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("invalid state `{raw}`")))
        })
        .transpose()?;
    let page_size = pagination::clamp_page_size(query.page_size);
    let before = pagination::parse_time_token(query.page_token.as_deref())?;
    let jobs = list(
        &pool,
        &tenant.namespace,
        state,
        query.plugin.as_deref(),
        page_size,
        before,
    )
    .await?;
    let next_page_token = if jobs.len() as i64 == page_size {
        jobs.last().map(|job| pagination::time_token(job.requested_at))
    } else {
        None
    };
    Ok(Json(JobList {
        jobs,
        next_page_token,
    }))
}

async fn get_job(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
) -> AppResult<Json<RefreshJob>> {
    let job = get(&pool, &tenant.namespace, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("refresh job `{id}` not found")))?;
    Ok(Json(job))
}

async fn cancel_job(
    Extension(pool): Extension<PgPool>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let job = get(&pool, &tenant.namespace, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("refresh job `{id}` not found")))?;
    if job.state != RefreshJobState::Queued {
        return Err(AppError::Conflict(
            "only queued jobs can be canceled".into(),
        ));
    }
    if !cancel(&pool, &tenant.namespace, id).await? {
        return Err(AppError::Conflict(
            "only queued jobs can be canceled".into(),
        ));
    }
    Ok(Json(json!({"status": "canceled"})))
}
