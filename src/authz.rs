use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;

use crate::config;
use crate::error::AppError;
use crate::tenancy::TenantContext;

pub const API_PREFIX: &str = "/api/governance/v1alpha1";

#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub resource: String,
    pub verb: String,
    pub namespace: String,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AccessRequest) -> Result<bool, AppError>;
}

/// Always allows. Used by unauthenticated deployments where the fronting
/// proxy is the trust boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthorizer;

#[async_trait]
impl Authorizer for NoopAuthorizer {
    async fn authorize(&self, _request: &AccessRequest) -> Result<bool, AppError> {
        Ok(true)
    }
}

/// Always denies. Test double for exercising the fail-closed path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllAuthorizer;

#[async_trait]
impl Authorizer for DenyAllAuthorizer {
    async fn authorize(&self, _request: &AccessRequest) -> Result<bool, AppError> {
        Ok(false)
    }
}

/// TTL cache over another authorizer. Decision caching keeps hot paths off
/// the delegate; entries are evicted lazily on lookup.
pub struct CachingAuthorizer {
    delegate: Arc<dyn Authorizer>,
    ttl: Duration,
    cache: DashMap<String, (bool, Instant)>,
}

impl CachingAuthorizer {
    pub fn new(delegate: Arc<dyn Authorizer>, ttl: Duration) -> Self {
        Self {
            delegate,
            ttl,
            cache: DashMap::new(),
        }
    }

    fn cache_key(request: &AccessRequest) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            request.user,
            request.groups.join(","),
            request.resource,
            request.verb,
            request.namespace
        )
    }
}

#[async_trait]
impl Authorizer for CachingAuthorizer {
    async fn authorize(&self, request: &AccessRequest) -> Result<bool, AppError> {
        let key = Self::cache_key(request);
        if let Some(entry) = self.cache.get(&key) {
            let (decision, stored_at) = *entry;
            if stored_at.elapsed() < self.ttl {
                return Ok(decision);
            }
            drop(entry);
            self.cache.remove(&key);
        }
        let decision = self.delegate.authorize(request).await?;
        self.cache.insert(key, (decision, Instant::now()));
        Ok(decision)
    }
}

pub fn authorizer_from_env() -> Arc<dyn Authorizer> {
    let base: Arc<dyn Authorizer> = match config::AUTHZ_MODE.as_str() {
        "deny" => Arc::new(DenyAllAuthorizer),
        _ => Arc::new(NoopAuthorizer),
    };
    let ttl_ms = *config::AUTHZ_CACHE_TTL_MS;
    if ttl_ms > 0 {
        Arc::new(CachingAuthorizer::new(base, Duration::from_millis(ttl_ms)))
    } else {
        base
    }
}

/// Static mapping from method + path to the (resource, verb) pair checked by
/// the authorizer. Anything unmapped is denied.
pub fn resource_verb(method: &Method, path: &str) -> Option<(&'static str, &'static str)> {
    let rest = path.strip_prefix(API_PREFIX)?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["assets"]) => Some(("assets", "list")),
        (&Method::GET, ["assets", _, _, _]) => Some(("assets", "get")),
        (&Method::PATCH, ["assets", _, _, _]) => Some(("assets", "update")),
        (&Method::DELETE, ["assets", _, _, _]) => Some(("assets", "delete")),
        (&Method::GET, ["assets", _, _, _, "history"]) => Some(("audit", "list")),
        (&Method::POST, ["assets", _, _, _, "actions", _]) => Some(("actions", "execute")),
        (&Method::GET, ["assets", _, _, _, "versions"]) => Some(("versions", "list")),
        (&Method::POST, ["assets", _, _, _, "versions"]) => Some(("versions", "create")),
        (&Method::GET, ["assets", _, _, _, "bindings"]) => Some(("bindings", "list")),
        (&Method::PUT, ["assets", _, _, _, "bindings", _]) => Some(("bindings", "update")),
        (&Method::GET, ["approvals"]) => Some(("approvals", "list")),
        (&Method::GET, ["approvals", _]) => Some(("approvals", "get")),
        (&Method::POST, ["approvals", _, "decisions"]) => Some(("approvals", "approve")),
        (&Method::POST, ["approvals", _, "cancel"]) => Some(("approvals", "approve")),
        (&Method::GET, ["policies"]) => Some(("policies", "list")),
        (&Method::POST, ["refresh"]) => Some(("refresh", "create")),
        (&Method::GET, ["jobs"]) => Some(("jobs", "list")),
        (&Method::GET, ["jobs", _]) => Some(("jobs", "get")),
        (&Method::POST, ["jobs", _, "cancel"]) => Some(("jobs", "update")),
        _ => None,
    }
}

/// Fail-closed authorization middleware. Runs after tenant resolution so the
/// check carries the resolved namespace and identity.
pub async fn authz_middleware<B>(
    Extension(authorizer): Extension<Arc<dyn Authorizer>>,
    tenant: TenantContext,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    let Some((resource, verb)) = resource_verb(request.method(), request.uri().path()) else {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "no authorization mapping for route"
        );
        return Err(AppError::Forbidden);
    };
    let access = AccessRequest {
        user: tenant.user.clone(),
        groups: tenant.groups.clone(),
        resource: resource.to_string(),
        verb: verb.to_string(),
        namespace: tenant.namespace.clone(),
    };
    if !authorizer.authorize(&access).await? {
        return Err(AppError::Forbidden);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn access(resource: &str, verb: &str) -> AccessRequest {
        AccessRequest {
            user: "alice".into(),
            groups: vec!["reviewers".into()],
            resource: resource.into(),
            verb: verb.into(),
            namespace: "default".into(),
        }
    }

    struct CountingAuthorizer {
        calls: AtomicUsize,
        decision: bool,
    }

    #[async_trait]
    impl Authorizer for CountingAuthorizer {
        async fn authorize(&self, _request: &AccessRequest) -> Result<bool, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision)
        }
    }

    #[test]
    fn table_maps_known_routes() {
        let path = |suffix: &str| format!("{API_PREFIX}{suffix}");
        assert_eq!(
            resource_verb(&Method::GET, &path("/assets/mcp/model/summarizer")),
            Some(("assets", "get"))
        );
        assert_eq!(
            resource_verb(&Method::PATCH, &path("/assets/mcp/model/summarizer")),
            Some(("assets", "update"))
        );
        assert_eq!(
            resource_verb(
                &Method::POST,
                &path("/assets/mcp/model/summarizer/actions/lifecycle.setState")
            ),
            Some(("actions", "execute"))
        );
        assert_eq!(
            resource_verb(&Method::PUT, &path("/assets/mcp/model/summarizer/bindings/prod")),
            Some(("bindings", "update"))
        );
        assert_eq!(
            resource_verb(&Method::POST, &path("/approvals/1234/decisions")),
            Some(("approvals", "approve"))
        );
        assert_eq!(
            resource_verb(&Method::POST, &path("/refresh")),
            Some(("refresh", "create"))
        );
        assert_eq!(
            resource_verb(&Method::GET, &path("/policies")),
            Some(("policies", "list"))
        );
    }

    #[test]
    fn unknown_routes_have_no_mapping() {
        assert_eq!(
            resource_verb(&Method::POST, &format!("{API_PREFIX}/assets/mcp/model/x")),
            None
        );
        assert_eq!(
            resource_verb(&Method::DELETE, &format!("{API_PREFIX}/approvals/1234")),
            None
        );
        assert_eq!(resource_verb(&Method::GET, "/api/other/v1/assets"), None);
    }

    #[tokio::test]
    async fn deny_all_denies() {
        let authorizer = DenyAllAuthorizer;
        assert!(!authorizer.authorize(&access("assets", "get")).await.unwrap());
    }

    #[tokio::test]
    async fn cache_short_circuits_within_ttl() {
        let inner = Arc::new(CountingAuthorizer {
            calls: AtomicUsize::new(0),
            decision: true,
        });
        let cached = CachingAuthorizer::new(inner.clone(), Duration::from_secs(60));
        let request = access("assets", "get");
        assert!(cached.authorize(&request).await.unwrap());
        assert!(cached.authorize(&request).await.unwrap());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let inner = Arc::new(CountingAuthorizer {
            calls: AtomicUsize::new(0),
            decision: false,
        });
        let cached = CachingAuthorizer::new(inner.clone(), Duration::from_millis(1));
        let request = access("assets", "get");
        assert!(!cached.authorize(&request).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!cached.authorize(&request).await.unwrap());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_subjects_get_distinct_entries() {
        let inner = Arc::new(CountingAuthorizer {
            calls: AtomicUsize::new(0),
            decision: true,
        });
        let cached = CachingAuthorizer::new(inner.clone(), Duration::from_secs(60));
        let mut second = access("assets", "get");
        second.user = "bob".into();
        cached.authorize(&access("assets", "get")).await.unwrap();
        cached.authorize(&second).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
