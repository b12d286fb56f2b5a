use axum::{middleware, Router};

use crate::{approvals, audit, authz, governance, jobs};

/// Governance API surface. Middleware order matters: identity and tenancy
/// resolve inside the extractors, authorization runs before any handler, and
/// the audit layer wraps both so denials are captured with their status.
pub fn api_routes() -> Router {
    let api = Router::new()
        .merge(governance::routes())
        .merge(approvals::routes())
        .merge(jobs::routes());
    Router::new()
        .nest(authz::API_PREFIX, api)
        .layer(middleware::from_fn(authz::authz_middleware))
        .layer(middleware::from_fn(audit::audit_middleware))
}
