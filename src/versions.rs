use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::provenance::Provenance;

/// Immutable snapshot of an asset at version-creation time. Rows are
/// write-once; there is intentionally no update path.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AssetVersion {
    pub id: Uuid,
    pub namespace: String,
    pub asset_uid: String,
    pub version_id: String,
    pub version_label: String,
    pub created_by: String,
    pub governance_snapshot: Value,
    pub asset_snapshot: Option<Value>,
    pub content_digest: Option<String>,
    pub provenance: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAssetVersion {
    pub namespace: String,
    pub asset_uid: String,
    pub version_label: String,
    pub created_by: String,
    pub governance_snapshot: Value,
    pub asset_snapshot: Option<Value>,
    pub content_digest: Option<String>,
    pub provenance: Option<Provenance>,
}

/// Version ids stay human-readable while a random suffix enforces global
/// uniqueness: `<label>:<8-hex-of-uuid>`.
pub fn new_version_id(label: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{label}:{}", &suffix[..8])
}

const VERSION_COLUMNS: &str = "id, namespace, asset_uid, version_id, version_label, created_by, \
     governance_snapshot, asset_snapshot, content_digest, provenance, created_at";

pub async fn create<'c, E>(
    executor: E,
    input: &NewAssetVersion,
) -> Result<AssetVersion, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let version_id = new_version_id(&input.version_label);
    let provenance = input
        .provenance
        .as_ref()
        .map(|p| serde_json::to_value(p).unwrap_or(Value::Null));
    sqlx::query_as::<_, AssetVersion>(&format!(
        r#"
        INSERT INTO asset_versions (
            namespace, asset_uid, version_id, version_label, created_by,
            governance_snapshot, asset_snapshot, content_digest, provenance
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {VERSION_COLUMNS}
        "#
    ))
    .bind(&input.namespace)
    .bind(&input.asset_uid)
    .bind(&version_id)
    .bind(&input.version_label)
    .bind(&input.created_by)
    .bind(&input.governance_snapshot)
    .bind(&input.asset_snapshot)
    .bind(&input.content_digest)
    .bind(provenance)
    .fetch_one(executor)
    .await
}

/// Miss is `None`, not an error; callers decide how strict to be.
pub async fn get<'c, E>(
    executor: E,
    namespace: &str,
    version_id: &str,
) -> Result<Option<AssetVersion>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, AssetVersion>(&format!(
        "SELECT {VERSION_COLUMNS} FROM asset_versions WHERE namespace = $1 AND version_id = $2"
    ))
    .bind(namespace)
    .bind(version_id)
    .fetch_optional(executor)
    .await
}

/// Newest-first keyset listing plus the total count for the asset.
pub async fn list(
    pool: &PgPool,
    namespace: &str,
    asset_uid: &str,
    page_size: i64,
    before: Option<DateTime<Utc>>,
) -> Result<(Vec<AssetVersion>, i64), sqlx::Error> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM asset_versions WHERE namespace = $1 AND asset_uid = $2",
    )
    .bind(namespace)
    .bind(asset_uid)
    .fetch_one(pool)
    .await?;

    let records = if let Some(before) = before {
        sqlx::query_as::<_, AssetVersion>(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM asset_versions
            WHERE namespace = $1 AND asset_uid = $2 AND created_at < $3
            ORDER BY created_at DESC LIMIT $4
            "#
        ))
        .bind(namespace)
        .bind(asset_uid)
        .bind(before)
        .bind(page_size)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, AssetVersion>(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM asset_versions
            WHERE namespace = $1 AND asset_uid = $2
            ORDER BY created_at DESC LIMIT $3
            "#
        ))
        .bind(namespace)
        .bind(asset_uid)
        .bind(page_size)
        .fetch_all(pool)
        .await?
    };
    Ok((records, total))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListResponse {
    pub versions: Vec<AssetVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    pub total_size: i64,
}
