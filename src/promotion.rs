use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::PgPool;

use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::bindings;
use crate::config::GovernanceSettings;
use crate::error::{AppError, AppResult};
use crate::governance::{store as governance_store, ActionResult, AssetRef};
use crate::lifecycle::LifecycleState;
use crate::provenance::ProvenanceExtractor;
use crate::tenancy::TenantContext;
use crate::versions::{self, NewAssetVersion};

pub const ACTION_VERSION_CREATE: &str = "version.create";
pub const ACTION_BIND: &str = "promotion.bind";
pub const ACTION_PROMOTE: &str = "promotion.promote";
pub const ACTION_ROLLBACK: &str = "promotion.rollback";

pub const DEPRECATED_WARNING: &str = "asset is deprecated; bindings remain served but should be migrated";

/// Lifecycle gate shared by all promotion actions. `environment` is `None`
/// for version.create, which has no target environment.
pub fn lifecycle_gate(
    state: LifecycleState,
    environment: Option<&str>,
) -> Result<Option<String>, AppError> {
    match state {
        LifecycleState::Archived if environment.is_some() => Err(AppError::BadRequest(
            "archived assets cannot be bound, promoted, or rolled back".into(),
        )),
        LifecycleState::Draft if matches!(environment, Some(env) if env != "dev") => Err(
            AppError::BadRequest("draft assets cannot be bound to stage/prod".into()),
        ),
        LifecycleState::Deprecated => Ok(Some(DEPRECATED_WARNING.to_string())),
        _ => Ok(None),
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, AppError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{field} is required")))
}

/// Executes version.create, promotion.bind, promotion.promote and
/// promotion.rollback against the version and binding stores.
#[derive(Clone)]
pub struct PromotionHandler {
    pub settings: Arc<GovernanceSettings>,
    pub provenance: Option<Arc<dyn ProvenanceExtractor>>,
}

impl PromotionHandler {
    pub fn new(
        settings: Arc<GovernanceSettings>,
        provenance: Option<Arc<dyn ProvenanceExtractor>>,
    ) -> Self {
        Self {
            settings,
            provenance,
        }
    }

    fn check_environment(&self, environment: &str) -> Result<(), AppError> {
        if self.settings.is_environment(environment) {
            Ok(())
        } else {
            Err(AppError::BadRequest(format!(
                "unknown environment `{environment}`"
            )))
        }
    }

    pub async fn handle(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        action: &str,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        match action {
            ACTION_VERSION_CREATE => self.version_create(pool, tenant, asset, params, dry_run).await,
            ACTION_BIND => self.bind(pool, tenant, asset, params, dry_run).await,
            ACTION_PROMOTE => self.promote(pool, tenant, asset, params, dry_run).await,
            ACTION_ROLLBACK => self.rollback(pool, tenant, asset, params, dry_run).await,
            other => Err(AppError::BadRequest(format!("unknown action `{other}`"))),
        }
    }

    pub async fn version_create(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        let label = required_str(params, "versionLabel")?;
        let reason = params.get("reason").and_then(Value::as_str);
        let record = governance_store::ensure_exists(pool, asset, None, &tenant.user).await?;
        let warning = lifecycle_gate(record.lifecycle_state, None)?;

        if dry_run {
            return Ok(ActionResult::dry_run(
                ACTION_VERSION_CREATE,
                json!({"versionLabel": label, "lifecycleState": record.lifecycle_state}),
            )
            .with_warning(warning));
        }

        let governance_snapshot = serde_json::to_value(&record)
            .map_err(|err| AppError::Internal(format!("snapshot encoding failed: {err}")))?;
        let captured = match self.provenance.as_ref() {
            Some(extractor) => Some(
                extractor
                    .extract(asset, &governance_snapshot)
                    .await
                    .map_err(|err| AppError::Internal(format!("provenance capture failed: {err}")))?,
            ),
            None => None,
        };

        let version = versions::create(
            pool,
            &NewAssetVersion {
                namespace: tenant.namespace.clone(),
                asset_uid: record.asset_uid.clone(),
                version_label: label.to_string(),
                created_by: tenant.user.clone(),
                governance_snapshot,
                asset_snapshot: None,
                content_digest: captured
                    .as_ref()
                    .and_then(|p| p.revision_id.clone())
                    .or_else(|| params.get("contentDigest").and_then(Value::as_str).map(str::to_string)),
                provenance: captured,
            },
        )
        .await?;

        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_VERSION_CREATED,
            &tenant.user,
            AuditOutcome::Success,
        );
        event.asset_uid = Some(record.asset_uid.clone());
        event.version_id = Some(version.version_id.clone());
        event.action = Some(ACTION_VERSION_CREATE.to_string());
        event.reason = reason.map(str::to_string);
        event.new_value = Some(json!({
            "versionId": version.version_id,
            "versionLabel": version.version_label,
        }));
        audit::append_best_effort(pool, &event).await;

        let data = serde_json::to_value(&version)
            .map_err(|err| AppError::Internal(format!("version encoding failed: {err}")))?;
        Ok(ActionResult::ok(ACTION_VERSION_CREATE, data).with_warning(warning))
    }

    pub async fn bind(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        let environment = required_str(params, "environment")?;
        let version_id = required_str(params, "versionId")?;
        self.check_environment(environment)?;

        if versions::get(pool, &tenant.namespace, version_id).await?.is_none() {
            return Err(AppError::NotFound(format!("version `{version_id}` not found")));
        }
        let record = governance_store::ensure_exists(pool, asset, None, &tenant.user).await?;
        let warning = lifecycle_gate(record.lifecycle_state, Some(environment))?;

        if dry_run {
            return Ok(ActionResult::dry_run(
                ACTION_BIND,
                json!({"environment": environment, "versionId": version_id}),
            )
            .with_warning(warning));
        }

        let previous = bindings::get(pool, asset, environment)
            .await?
            .map(|binding| binding.version_id);
        let binding = bindings::set(
            pool,
            asset,
            environment,
            &record.asset_uid,
            version_id,
            &tenant.user,
        )
        .await?;

        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_PROMOTION_BOUND,
            &tenant.user,
            AuditOutcome::Success,
        );
        event.asset_uid = Some(record.asset_uid.clone());
        event.version_id = Some(version_id.to_string());
        event.action = Some(ACTION_BIND.to_string());
        event.old_value = previous
            .as_ref()
            .map(|prev| json!({"versionId": prev, "environment": environment}));
        event.new_value = Some(json!({"versionId": version_id, "environment": environment}));
        audit::append_best_effort(pool, &event).await;

        let data = serde_json::to_value(&binding)
            .map_err(|err| AppError::Internal(format!("binding encoding failed: {err}")))?;
        Ok(ActionResult::ok(ACTION_BIND, data).with_warning(warning))
    }

    pub async fn promote(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        let from_env = required_str(params, "fromEnv")?;
        let to_env = required_str(params, "toEnv")?;
        if from_env == to_env {
            return Err(AppError::BadRequest("fromEnv and toEnv must differ".into()));
        }
        self.check_environment(from_env)?;
        self.check_environment(to_env)?;

        let source = bindings::get(pool, asset, from_env).await?.ok_or_else(|| {
            AppError::NotFound(format!("no binding for environment `{from_env}`"))
        })?;
        let record = governance_store::ensure_exists(pool, asset, None, &tenant.user).await?;
        let warning = lifecycle_gate(record.lifecycle_state, Some(to_env))?;

        if dry_run {
            return Ok(ActionResult::dry_run(
                ACTION_PROMOTE,
                json!({"fromEnv": from_env, "toEnv": to_env, "versionId": source.version_id}),
            )
            .with_warning(warning));
        }

        let binding = bindings::set(
            pool,
            asset,
            to_env,
            &record.asset_uid,
            &source.version_id,
            &tenant.user,
        )
        .await?;

        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_PROMOTION_PROMOTED,
            &tenant.user,
            AuditOutcome::Success,
        );
        event.asset_uid = Some(record.asset_uid.clone());
        event.version_id = Some(source.version_id.clone());
        event.action = Some(ACTION_PROMOTE.to_string());
        event.new_value = Some(json!({
            "fromEnv": from_env,
            "toEnv": to_env,
            "versionId": source.version_id,
            "previousVersionId": binding.previous_version_id,
        }));
        audit::append_best_effort(pool, &event).await;

        let data = serde_json::to_value(&binding)
            .map_err(|err| AppError::Internal(format!("binding encoding failed: {err}")))?;
        Ok(ActionResult::ok(ACTION_PROMOTE, data).with_warning(warning))
    }

    pub async fn rollback(
        &self,
        pool: &PgPool,
        tenant: &TenantContext,
        asset: &AssetRef,
        params: &Value,
        dry_run: bool,
    ) -> AppResult<ActionResult> {
        let environment = required_str(params, "environment")?;
        let target_version_id = required_str(params, "targetVersionId")?;
        self.check_environment(environment)?;

        if versions::get(pool, &tenant.namespace, target_version_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(format!(
                "version `{target_version_id}` not found"
            )));
        }
        let record = governance_store::ensure_exists(pool, asset, None, &tenant.user).await?;
        let warning = lifecycle_gate(record.lifecycle_state, Some(environment))?;

        if dry_run {
            return Ok(ActionResult::dry_run(
                ACTION_ROLLBACK,
                json!({"environment": environment, "targetVersionId": target_version_id}),
            )
            .with_warning(warning));
        }

        let current = bindings::get(pool, asset, environment)
            .await?
            .map(|binding| binding.version_id);
        let binding = bindings::set(
            pool,
            asset,
            environment,
            &record.asset_uid,
            target_version_id,
            &tenant.user,
        )
        .await?;

        let mut event = NewAuditEvent::new(
            &tenant.namespace,
            audit::EVENT_PROMOTION_ROLLBACK,
            &tenant.user,
            AuditOutcome::Success,
        );
        event.asset_uid = Some(record.asset_uid.clone());
        event.version_id = Some(target_version_id.to_string());
        event.action = Some(ACTION_ROLLBACK.to_string());
        event.old_value = current
            .as_ref()
            .map(|prev| json!({"versionId": prev, "environment": environment}));
        event.new_value = Some(json!({
            "versionId": target_version_id,
            "environment": environment,
            "previousVersionId": binding.previous_version_id,
        }));
        audit::append_best_effort(pool, &event).await;

        let data = serde_json::to_value(&binding)
            .map_err(|err| AppError::Internal(format!("binding encoding failed: {err}")))?;
        Ok(ActionResult::ok(ACTION_ROLLBACK, data).with_warning(warning))
    }
}
