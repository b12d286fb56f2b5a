use std::sync::Arc;

use axum::{Extension, Router};
use catalog_governance::approvals::{
    ApprovalPolicy, PolicyGate, PolicySelector, TransitionSelector,
};
use catalog_governance::authz::{Authorizer, NoopAuthorizer};
use catalog_governance::config::GovernanceSettings;
use catalog_governance::governance::ActionDispatcher;
use catalog_governance::jobs::RefreshQueue;
use catalog_governance::promotion::PromotionHandler;
use catalog_governance::routes::api_routes;
use hyper::{Body, Request, StatusCode};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

const ASSET: &str = "/api/governance/v1alpha1/assets/mcp/model/summarizer";
const APPROVALS: &str = "/api/governance/v1alpha1/approvals";

fn gated_settings() -> GovernanceSettings {
    GovernanceSettings {
        policies: vec![
            ApprovalPolicy {
                id: "high-risk".into(),
                display_name: "High risk changes".into(),
                enabled: true,
                selector: PolicySelector {
                    risk_levels: vec!["critical".into()],
                    ..Default::default()
                },
                gate: PolicyGate {
                    required_count: 2,
                    allowed_roles: Vec::new(),
                    deny_on_first: false,
                },
                expiry_hours: Some(48),
            },
            ApprovalPolicy {
                id: "prod-gate".into(),
                display_name: "Production gate".into(),
                enabled: true,
                selector: PolicySelector {
                    risk_levels: vec!["high".into()],
                    transitions: vec![TransitionSelector {
                        from: "*".into(),
                        to: "approved".into(),
                    }],
                    ..Default::default()
                },
                gate: PolicyGate {
                    required_count: 1,
                    allowed_roles: Vec::new(),
                    deny_on_first: true,
                },
                expiry_hours: None,
            },
        ],
        ..Default::default()
    }
}

fn app(pool: PgPool, settings: GovernanceSettings) -> Router {
    let settings = Arc::new(settings);
    let promotion = PromotionHandler::new(settings.clone(), None);
    let dispatcher = ActionDispatcher::new(settings, Some(promotion));
    Router::new()
        .merge(api_routes())
        .layer(Extension(pool))
        .layer(Extension(Arc::new(NoopAuthorizer) as Arc<dyn Authorizer>))
        .layer(Extension(dispatcher))
        .layer(Extension(RefreshQueue { enabled: true }))
}

fn request(method: &str, uri: &str, user: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Remote-User", user)
        .header("Content-Type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: hyper::Response<axum::body::BoxBody>) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn set_risk(app: &Router, risk: &str) {
    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            ASSET,
            "requester",
            Some(json!({"riskLevel": risk})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn request_approval(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/lifecycle.setState"),
            "requester",
            Some(json!({"params": {"state": "approved"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending-approval");
    body["requestId"].as_str().unwrap().to_string()
}

async fn decide(app: &Router, id: &str, reviewer: &str, verdict: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("{APPROVALS}/{id}/decisions"),
            reviewer,
            Some(json!({"verdict": verdict})),
        ))
        .await
        .unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn quorum_of_two_auto_executes_on_second_approval(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone(), gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    let (status, body) = decide(&app, &request_id, "alice", "approve").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "pending");
    assert_eq!(body["approves"], 1);
    assert_eq!(body["autoExecuted"], false);

    // The gated action has not run yet.
    let response = app
        .clone()
        .oneshot(request("GET", ASSET, "requester", None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["lifecycleState"], "draft");

    let (status, body) = decide(&app, &request_id, "bob", "approve").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "approved");
    assert_eq!(body["autoExecuted"], true);

    let response = app
        .clone()
        .oneshot(request("GET", ASSET, "requester", None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["lifecycleState"], "approved");

    let response = app
        .oneshot(request(
            "GET",
            &format!("{APPROVALS}/{request_id}"),
            "requester",
            None,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "approved");
    assert_eq!(body["resolvedBy"], "bob");
    assert_eq!(body["resolutionNote"], "threshold met");
    assert_eq!(body["decisions"].as_array().unwrap().len(), 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn deny_on_first_blocks_without_lifecycle_change(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone(), gated_settings());

    set_risk(&app, "high").await;
    let request_id = request_approval(&app).await;

    let (status, body) = decide(&app, &request_id, "alice", "deny").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "denied");

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("{APPROVALS}/{request_id}"),
            "alice",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "denied");

    let response = app
        .oneshot(request("GET", ASSET, "requester", None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["lifecycleState"], "draft");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn requester_cannot_approve_own_request(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    let (status, body) = decide(&app, &request_id, "requester", "approve").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    // A requester may still deny their own request.
    let (status, _) = decide(&app, &request_id, "requester", "deny").await;
    assert_eq!(status, StatusCode::OK);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn one_decision_per_reviewer(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    let (status, _) = decide(&app, &request_id, "alice", "approve").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = decide(&app, &request_id, "alice", "approve").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn terminal_requests_reject_decisions_and_cancel(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    set_risk(&app, "high").await;
    let request_id = request_approval(&app).await;

    let (status, _) = decide(&app, &request_id, "alice", "deny").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = decide(&app, &request_id, "bob", "approve").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let response = app
        .oneshot(request(
            "POST",
            &format!("{APPROVALS}/{request_id}/cancel"),
            "bob",
            Some(json!({"reason": "moot"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancel_marks_pending_request_canceled(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("{APPROVALS}/{request_id}/cancel"),
            "ops",
            Some(json!({"reason": "superseded"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "canceled");

    let response = app
        .oneshot(request(
            "GET",
            &format!("{APPROVALS}/{request_id}"),
            "ops",
            None,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "canceled");
    assert_eq!(body["resolutionNote"], "superseded");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approvals_listing_filters_by_status(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("{APPROVALS}?status=pending"),
            "alice",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let requests = body["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["id"], request_id.as_str());

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("{APPROVALS}?status=approved"),
            "alice",
            None,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["requests"].as_array().unwrap().is_empty());

    let response = app
        .oneshot(request("GET", &format!("{APPROVALS}?status=bogus"), "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expired_requests_reject_further_decisions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone(), gated_settings());

    set_risk(&app, "critical").await;
    let request_id = request_approval(&app).await;

    sqlx::query("UPDATE approval_requests SET expires_at = NOW() - INTERVAL '1 hour' WHERE id = $1::uuid")
        .bind(&request_id)
        .execute(&pool)
        .await
        .unwrap();
    let expired = catalog_governance::approvals::store::expire_due(&pool, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    let (status, _) = decide(&app, &request_id, "alice", "approve").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn policies_endpoint_lists_loaded_policies(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool, gated_settings());

    let response = app
        .oneshot(request(
            "GET",
            "/api/governance/v1alpha1/policies",
            "alice",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let policies = body["policies"].as_array().unwrap();
    assert_eq!(policies.len(), 2);
    assert_eq!(policies[0]["id"], "high-risk");
    assert_eq!(policies[0]["gate"]["requiredCount"], 2);
}
