use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::approvals::ApprovalPolicy;

/// Address the HTTP server binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server binds to. Defaults to `8080`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8080)
});

/// Tenancy mode: `single` (everything lives in the `default` namespace) or
/// `namespace` (namespace required on every request).
pub static TENANCY_MODE: Lazy<String> =
    Lazy::new(|| std::env::var("TENANCY_MODE").unwrap_or_else(|_| "single".to_string()));

/// Authorizer selection: `noop` or `deny`.
pub static AUTHZ_MODE: Lazy<String> =
    Lazy::new(|| std::env::var("AUTHZ_MODE").unwrap_or_else(|_| "noop".to_string()));

/// TTL for cached authorization decisions, in milliseconds. `0` disables the cache.
pub static AUTHZ_CACHE_TTL_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("AUTHZ_CACHE_TTL_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
});

/// Whether the audit middleware persists events at all.
pub static AUDIT_ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var("AUDIT_ENABLED")
        .map(|raw| raw != "false" && raw != "0")
        .unwrap_or(true)
});

/// Whether 403 outcomes are persisted by the audit middleware.
pub static AUDIT_LOG_DENIED: Lazy<bool> = Lazy::new(|| {
    std::env::var("AUDIT_LOG_DENIED")
        .map(|raw| raw != "false" && raw != "0")
        .unwrap_or(true)
});

/// Maximum claim attempts before a refresh job goes terminally failed.
pub static REFRESH_MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("REFRESH_MAX_ATTEMPTS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(3)
});

/// Seconds a job may sit in `running` before the recovery sweep requeues it.
pub static REFRESH_JOB_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("REFRESH_JOB_TTL_SECS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(900)
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRetention {
    pub days: i64,
}

impl Default for AuditRetention {
    fn default() -> Self {
        Self { days: 90 }
    }
}

fn default_environments() -> Vec<String> {
    vec!["dev".to_string(), "stage".to_string(), "prod".to_string()]
}

/// Startup-loaded governance settings. Immutable once loaded; shared via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernanceSettings {
    pub environments: Vec<String>,
    pub trusted_sources: Vec<String>,
    pub audit_retention: AuditRetention,
    pub policies: Vec<ApprovalPolicy>,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            environments: default_environments(),
            trusted_sources: Vec::new(),
            audit_retention: AuditRetention::default(),
            policies: Vec::new(),
        }
    }
}

impl GovernanceSettings {
    /// Load settings from the YAML file named by `GOVERNANCE_CONFIG`.
    /// A missing variable or file yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        let Some(path) = std::env::var("GOVERNANCE_CONFIG").ok().filter(|p| !p.is_empty()) else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)?;
        let mut settings: GovernanceSettings = serde_yaml::from_str(&raw)?;
        if settings.environments.is_empty() {
            settings.environments = default_environments();
        }
        Ok(settings)
    }

    pub fn is_environment(&self, env: &str) -> bool {
        self.environments.iter().any(|candidate| candidate == env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_standard_environments() {
        let settings = GovernanceSettings::default();
        assert_eq!(settings.environments, vec!["dev", "stage", "prod"]);
        assert_eq!(settings.audit_retention.days, 90);
        assert!(settings.policies.is_empty());
    }

    #[test]
    fn settings_parse_from_yaml() {
        let raw = r#"
environments: [dev, prod]
trustedSources: ["git.internal"]
auditRetention:
  days: 30
policies:
  - id: high-risk
    displayName: High risk changes
    selector:
      riskLevels: [high, critical]
    gate:
      requiredCount: 2
"#;
        let settings: GovernanceSettings = serde_yaml::from_str(raw).unwrap();
        assert_eq!(settings.environments, vec!["dev", "prod"]);
        assert_eq!(settings.audit_retention.days, 30);
        assert_eq!(settings.policies.len(), 1);
        assert_eq!(settings.policies[0].gate.required_count, 2);
        assert!(settings.policies[0].enabled);
    }
}
