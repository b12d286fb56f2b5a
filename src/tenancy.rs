use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config;
use crate::error::AppError;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const ANONYMOUS_USER: &str = "anonymous";

static NAMESPACE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("namespace pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenancyMode {
    Single,
    Namespace,
}

impl TenancyMode {
    pub fn from_env() -> Self {
        match config::TENANCY_MODE.as_str() {
            "namespace" => TenancyMode::Namespace,
            _ => TenancyMode::Single,
        }
    }
}

/// Per-request tenant and identity context. Attached by extraction on every
/// governance route; downstream stores receive the namespace explicitly.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub namespace: String,
    pub user: String,
    pub groups: Vec<String>,
}

pub fn valid_namespace(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.len() <= 63 && NAMESPACE_PATTERN.is_match(candidate)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolve the acting identity from trusted proxy headers. `X-User-Principal`
/// wins, then `X-Remote-User`, then the `X-User-Role` fallback.
pub fn identity_from_headers(headers: &HeaderMap) -> (String, Vec<String>) {
    let user = header_value(headers, "x-user-principal")
        .or_else(|| header_value(headers, "x-remote-user"))
        .or_else(|| header_value(headers, "x-user-role"))
        .unwrap_or(ANONYMOUS_USER)
        .to_string();
    let groups = header_value(headers, "x-remote-group")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|group| !group.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    (user, groups)
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Resolve the request namespace for the configured mode. The query parameter
/// takes precedence over the `X-Namespace` header.
pub fn resolve_namespace(
    mode: TenancyMode,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<String, AppError> {
    match mode {
        TenancyMode::Single => Ok(DEFAULT_NAMESPACE.to_string()),
        TenancyMode::Namespace => {
            let candidate = query_param(query, "namespace")
                .or_else(|| header_value(headers, "x-namespace"))
                .ok_or_else(|| {
                    AppError::BadRequest("namespace is required in namespace tenancy mode".into())
                })?;
            if !valid_namespace(candidate) {
                return Err(AppError::BadRequest(format!(
                    "invalid namespace `{candidate}`"
                )));
            }
            Ok(candidate.to_string())
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let mode = TenancyMode::from_env();
        let namespace = resolve_namespace(mode, parts.uri.query(), &parts.headers)?;
        let (user, groups) = identity_from_headers(&parts.headers);
        Ok(TenantContext {
            namespace,
            user,
            groups,
        })
    }
}
