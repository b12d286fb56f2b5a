use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::models::{AssetRef, GovernanceRecord, DEFAULT_RISK_LEVEL};
use crate::lifecycle::LifecycleState;

const RECORD_COLUMNS: &str = "id, namespace, plugin, kind, name, asset_uid, owner, team, sla, \
     risk_level, compliance, intended_use, lifecycle_state, lifecycle_reason, \
     lifecycle_changed_by, lifecycle_changed_at, audit_cadence_days, created_at, updated_at";

pub async fn get<'c, E>(executor: E, asset: &AssetRef) -> Result<Option<GovernanceRecord>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GovernanceRecord>(&format!(
        r#"
        SELECT {RECORD_COLUMNS}
        FROM governance_records
        WHERE namespace = $1 AND plugin = $2 AND kind = $3 AND name = $4
        "#
    ))
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .fetch_optional(executor)
    .await
}

pub async fn get_by_uid<'c, E>(
    executor: E,
    namespace: &str,
    asset_uid: &str,
) -> Result<Option<GovernanceRecord>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GovernanceRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM governance_records WHERE namespace = $1 AND asset_uid = $2"
    ))
    .bind(namespace)
    .bind(asset_uid)
    .fetch_optional(executor)
    .await
}

/// Row-locked read for the approval-execution path; serializes transitions
/// on one asset.
pub async fn get_by_uid_for_update<'c, E>(
    executor: E,
    namespace: &str,
    asset_uid: &str,
) -> Result<Option<GovernanceRecord>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GovernanceRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM governance_records \
         WHERE namespace = $1 AND asset_uid = $2 FOR UPDATE"
    ))
    .bind(namespace)
    .bind(asset_uid)
    .fetch_optional(executor)
    .await
}

/// Write the record back. Conflict key is (namespace, asset_uid).
pub async fn upsert<'c, E>(
    executor: E,
    record: &GovernanceRecord,
) -> Result<GovernanceRecord, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GovernanceRecord>(&format!(
        r#"
        INSERT INTO governance_records (
            id, namespace, plugin, kind, name, asset_uid, owner, team, sla, risk_level,
            compliance, intended_use, lifecycle_state, lifecycle_reason,
            lifecycle_changed_by, lifecycle_changed_at, audit_cadence_days
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (namespace, asset_uid) DO UPDATE SET
            owner = EXCLUDED.owner,
            team = EXCLUDED.team,
            sla = EXCLUDED.sla,
            risk_level = EXCLUDED.risk_level,
            compliance = EXCLUDED.compliance,
            intended_use = EXCLUDED.intended_use,
            lifecycle_state = EXCLUDED.lifecycle_state,
            lifecycle_reason = EXCLUDED.lifecycle_reason,
            lifecycle_changed_by = EXCLUDED.lifecycle_changed_by,
            lifecycle_changed_at = EXCLUDED.lifecycle_changed_at,
            audit_cadence_days = EXCLUDED.audit_cadence_days,
            updated_at = NOW()
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(record.id)
    .bind(&record.namespace)
    .bind(&record.plugin)
    .bind(&record.kind)
    .bind(&record.name)
    .bind(&record.asset_uid)
    .bind(&record.owner)
    .bind(&record.team)
    .bind(&record.sla)
    .bind(&record.risk_level)
    .bind(&record.compliance)
    .bind(&record.intended_use)
    .bind(record.lifecycle_state)
    .bind(&record.lifecycle_reason)
    .bind(&record.lifecycle_changed_by)
    .bind(record.lifecycle_changed_at)
    .bind(record.audit_cadence_days)
    .fetch_one(executor)
    .await
}

pub async fn delete<'c, E>(executor: E, asset: &AssetRef) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "DELETE FROM governance_records \
         WHERE namespace = $1 AND plugin = $2 AND kind = $3 AND name = $4",
    )
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Keyset listing by id ascending; the token is the last id of the previous
/// page.
pub async fn list(
    pool: &PgPool,
    namespace: &str,
    plugin: Option<&str>,
    page_size: i64,
    after: Option<Uuid>,
) -> Result<Vec<GovernanceRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {RECORD_COLUMNS} FROM governance_records WHERE namespace = "
    ));
    builder.push_bind(namespace);
    if let Some(plugin) = plugin {
        builder.push(" AND plugin = ");
        builder.push_bind(plugin);
    }
    if let Some(after) = after {
        builder.push(" AND id > ");
        builder.push_bind(after);
    }
    builder.push(" ORDER BY id LIMIT ");
    builder.push_bind(page_size);
    builder
        .build_query_as::<GovernanceRecord>()
        .fetch_all(pool)
        .await
}

/// Return the existing record or lazily create the default draft overlay.
/// Insert races resolve via the unique key; losers re-read the winner's row.
pub async fn ensure_exists(
    pool: &PgPool,
    asset: &AssetRef,
    uid: Option<&str>,
    changed_by: &str,
) -> Result<GovernanceRecord, sqlx::Error> {
    if let Some(existing) = get(pool, asset).await? {
        return Ok(existing);
    }
    let asset_uid = uid
        .map(str::to_string)
        .unwrap_or_else(|| asset.default_uid());
    sqlx::query(
        r#"
        INSERT INTO governance_records (
            namespace, plugin, kind, name, asset_uid, risk_level,
            lifecycle_state, lifecycle_changed_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'draft', $7)
        ON CONFLICT (namespace, asset_uid) DO NOTHING
        "#,
    )
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .bind(&asset_uid)
    .bind(DEFAULT_RISK_LEVEL)
    .bind(changed_by)
    .execute(pool)
    .await?;

    match get(pool, asset).await? {
        Some(record) => Ok(record),
        None => Err(sqlx::Error::RowNotFound),
    }
}

/// Apply a validated lifecycle transition to a single row.
pub async fn set_lifecycle<'c, E>(
    executor: E,
    id: Uuid,
    to: LifecycleState,
    reason: Option<&str>,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<GovernanceRecord, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GovernanceRecord>(&format!(
        r#"
        UPDATE governance_records
        SET lifecycle_state = $2,
            lifecycle_reason = $3,
            lifecycle_changed_by = $4,
            lifecycle_changed_at = $5,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(to)
    .bind(reason)
    .bind(actor)
    .bind(now)
    .fetch_one(executor)
    .await
}
