use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::governance::AssetRef;

/// Current version bound to one environment for one asset. Exactly one row
/// per (namespace, plugin, kind, name, environment).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EnvBinding {
    pub id: Uuid,
    pub namespace: String,
    pub plugin: String,
    pub kind: String,
    pub name: String,
    pub environment: String,
    pub asset_uid: String,
    pub version_id: String,
    pub bound_at: DateTime<Utc>,
    pub bound_by: String,
    pub previous_version_id: String,
}

const BINDING_COLUMNS: &str = "id, namespace, plugin, kind, name, environment, asset_uid, \
     version_id, bound_at, bound_by, previous_version_id";

pub async fn get<'c, E>(
    executor: E,
    asset: &AssetRef,
    environment: &str,
) -> Result<Option<EnvBinding>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, EnvBinding>(&format!(
        r#"
        SELECT {BINDING_COLUMNS} FROM env_bindings
        WHERE namespace = $1 AND plugin = $2 AND kind = $3 AND name = $4 AND environment = $5
        "#
    ))
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .bind(environment)
    .fetch_optional(executor)
    .await
}

/// Upsert on the unique tuple. The unique index is the linearization point:
/// `previous_version_id` always captures the pre-write `version_id`, so a
/// single-step rollback is deterministic even under concurrent writers.
pub async fn set<'c, E>(
    executor: E,
    asset: &AssetRef,
    environment: &str,
    asset_uid: &str,
    version_id: &str,
    bound_by: &str,
) -> Result<EnvBinding, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, EnvBinding>(&format!(
        r#"
        INSERT INTO env_bindings (
            namespace, plugin, kind, name, environment, asset_uid,
            version_id, bound_by, previous_version_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '')
        ON CONFLICT (namespace, plugin, kind, name, environment) DO UPDATE SET
            previous_version_id = env_bindings.version_id,
            version_id = EXCLUDED.version_id,
            asset_uid = EXCLUDED.asset_uid,
            bound_by = EXCLUDED.bound_by,
            bound_at = NOW()
        RETURNING {BINDING_COLUMNS}
        "#
    ))
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .bind(environment)
    .bind(asset_uid)
    .bind(version_id)
    .bind(bound_by)
    .fetch_one(executor)
    .await
}

pub async fn list(pool: &PgPool, asset: &AssetRef) -> Result<Vec<EnvBinding>, sqlx::Error> {
    sqlx::query_as::<_, EnvBinding>(&format!(
        r#"
        SELECT {BINDING_COLUMNS} FROM env_bindings
        WHERE namespace = $1 AND plugin = $2 AND kind = $3 AND name = $4
        ORDER BY environment
        "#
    ))
    .bind(&asset.namespace)
    .bind(&asset.plugin)
    .bind(&asset.kind)
    .bind(&asset.name)
    .fetch_all(pool)
    .await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingsResponse {
    pub bindings: Vec<EnvBinding>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBindingResponse {
    pub binding: EnvBinding,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
