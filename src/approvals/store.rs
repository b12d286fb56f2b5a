use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::models::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, NewApprovalRequest, Verdict,
};

const REQUEST_COLUMNS: &str = "id, namespace, asset_uid, plugin, asset_kind, asset_name, action, \
     action_params, policy_id, required_count, status, requester, reason, resolved_at, \
     resolved_by, resolution_note, expires_at, created_at";

pub async fn insert_request<'c, E>(
    executor: E,
    input: &NewApprovalRequest,
) -> Result<ApprovalRequest, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApprovalRequest>(&format!(
        r#"
        INSERT INTO approval_requests (
            namespace, asset_uid, plugin, asset_kind, asset_name, action, action_params,
            policy_id, required_count, requester, reason, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {REQUEST_COLUMNS}
        "#
    ))
    .bind(&input.namespace)
    .bind(&input.asset_uid)
    .bind(&input.plugin)
    .bind(&input.asset_kind)
    .bind(&input.asset_name)
    .bind(&input.action)
    .bind(&input.action_params)
    .bind(&input.policy_id)
    .bind(input.required_count)
    .bind(&input.requester)
    .bind(&input.reason)
    .bind(input.expires_at)
    .fetch_one(executor)
    .await
}

pub async fn get_request<'c, E>(
    executor: E,
    namespace: &str,
    id: Uuid,
) -> Result<Option<ApprovalRequest>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE namespace = $1 AND id = $2"
    ))
    .bind(namespace)
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Row-locked read used while a decision is being applied, so concurrent
/// decisions on one request serialize.
pub async fn get_request_for_update<'c, E>(
    executor: E,
    namespace: &str,
    id: Uuid,
) -> Result<Option<ApprovalRequest>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE namespace = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(namespace)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn list_requests(
    pool: &PgPool,
    namespace: &str,
    status: Option<ApprovalStatus>,
    asset_uid: Option<&str>,
    page_size: i64,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<ApprovalRequest>, sqlx::Error> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE namespace = "
    ));
    builder.push_bind(namespace);
    if let Some(status) = status {
        builder.push(" AND status = ");
        builder.push_bind(status);
    }
    if let Some(asset_uid) = asset_uid {
        builder.push(" AND asset_uid = ");
        builder.push_bind(asset_uid);
    }
    if let Some(before) = before {
        builder.push(" AND created_at < ");
        builder.push_bind(before);
    }
    builder.push(" ORDER BY created_at DESC LIMIT ");
    builder.push_bind(page_size);
    builder
        .build_query_as::<ApprovalRequest>()
        .fetch_all(pool)
        .await
}

pub async fn list_decisions<'c, E>(
    executor: E,
    request_id: Uuid,
) -> Result<Vec<ApprovalDecision>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApprovalDecision>(
        r#"
        SELECT id, request_id, reviewer, verdict, comment, created_at
        FROM approval_decisions
        WHERE request_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(request_id)
    .fetch_all(executor)
    .await
}

pub async fn reviewer_has_decided<'c, E>(
    executor: E,
    request_id: Uuid,
    reviewer: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM approval_decisions WHERE request_id = $1 AND reviewer = $2",
    )
    .bind(request_id)
    .bind(reviewer)
    .fetch_one(executor)
    .await?;
    Ok(count > 0)
}

pub async fn insert_decision<'c, E>(
    executor: E,
    request_id: Uuid,
    reviewer: &str,
    verdict: Verdict,
    comment: Option<&str>,
) -> Result<ApprovalDecision, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApprovalDecision>(
        r#"
        INSERT INTO approval_decisions (request_id, reviewer, verdict, comment)
        VALUES ($1, $2, $3, $4)
        RETURNING id, request_id, reviewer, verdict, comment, created_at
        "#,
    )
    .bind(request_id)
    .bind(reviewer)
    .bind(verdict)
    .bind(comment)
    .fetch_one(executor)
    .await
}

pub async fn decision_counts<'c, E>(
    executor: E,
    request_id: Uuid,
) -> Result<(i64, i64), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE verdict = 'approve'),
            COUNT(*) FILTER (WHERE verdict = 'deny')
        FROM approval_decisions
        WHERE request_id = $1
        "#,
    )
    .bind(request_id)
    .fetch_one(executor)
    .await?;
    Ok(row)
}

/// Move a pending request to a terminal status. Returns false when the
/// request was already terminal, which callers surface as a conflict.
pub async fn resolve<'c, E>(
    executor: E,
    id: Uuid,
    status: ApprovalStatus,
    resolved_by: &str,
    note: Option<&str>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE approval_requests
        SET status = $2, resolved_at = NOW(), resolved_by = $3, resolution_note = $4
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(resolved_by)
    .bind(note)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Expire pending requests whose deadline has passed. Returns the expired
/// rows so each can be audited.
pub async fn expire_due(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<ApprovalRequest>, sqlx::Error> {
    sqlx::query_as::<_, ApprovalRequest>(&format!(
        r#"
        UPDATE approval_requests
        SET status = 'expired', resolved_at = NOW(), resolution_note = 'expired'
        WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < $1
        RETURNING {REQUEST_COLUMNS}
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await
}
