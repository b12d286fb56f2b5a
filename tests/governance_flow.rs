use std::sync::Arc;

use axum::{Extension, Router};
use catalog_governance::authz::NoopAuthorizer;
use catalog_governance::config::GovernanceSettings;
use catalog_governance::governance::ActionDispatcher;
use catalog_governance::jobs::RefreshQueue;
use catalog_governance::promotion::PromotionHandler;
use catalog_governance::routes::api_routes;
use hyper::{Body, Request, StatusCode};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

fn app(pool: PgPool) -> Router {
    app_with_settings(pool, GovernanceSettings::default())
}

fn app_with_settings(pool: PgPool, settings: GovernanceSettings) -> Router {
    let settings = Arc::new(settings);
    let promotion = PromotionHandler::new(settings.clone(), None);
    let dispatcher = ActionDispatcher::new(settings, Some(promotion));
    Router::new()
        .merge(api_routes())
        .layer(Extension(pool))
        .layer(Extension(
            Arc::new(NoopAuthorizer) as Arc<dyn catalog_governance::authz::Authorizer>
        ))
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

const ASSET: &str = "/api/governance/v1alpha1/assets/mcp/model/summarizer";

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn get_auto_creates_default_draft(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let response = app
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["lifecycleState"], "draft");
    assert_eq!(body["riskLevel"], "medium");
    assert_eq!(body["assetUid"], "mcp:model:summarizer");
    assert_eq!(body["lifecycleChangedBy"], "alice");
    assert_eq!(body["allowedTransitions"], json!(["approved"]));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM governance_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn patch_is_additive_and_round_trips(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            ASSET,
            "alice",
            Some(json!({"owner": "alice", "team": "ml-platform"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Empty overlay leaves everything in place.
    let response = app
        .clone()
        .oneshot(request("PATCH", ASSET, "bob", Some(json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["owner"], "alice");
    assert_eq!(body["team"], "ml-platform");
    assert_eq!(body["riskLevel"], "medium");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn direct_approve_without_policy_executes_and_audits(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            ASSET,
            "alice",
            Some(json!({"riskLevel": "low"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/lifecycle.setState"),
            "alice",
            Some(json!({"params": {"state": "approved"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"]["lifecycleState"], "approved");

    let response = app
        .clone()
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["lifecycleState"], "approved");

    let response = app
        .oneshot(request("GET", &format!("{ASSET}/history"), "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let events = body["events"].as_array().unwrap();
    let changed = events
        .iter()
        .find(|event| event["eventType"] == "governance.lifecycle.changed")
        .expect("lifecycle change event");
    assert_eq!(changed["oldValue"]["lifecycleState"], "draft");
    assert_eq!(changed["newValue"]["lifecycleState"], "approved");
    assert_eq!(changed["actor"], "alice");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn denied_transition_returns_structured_error(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);

    let response = app
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/lifecycle.archive"),
            "alice",
            Some(json!({})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "transition_error");
    assert_eq!(body["code"], "LIFECYCLE_TRANSITION_DENIED");
    assert_eq!(body["from"], "draft");
    assert_eq!(body["to"], "archived");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_action_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);

    let response = app
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/catalog.reindex"),
            "alice",
            Some(json!({})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "bad_request");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn malformed_page_token_is_bad_request(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);

    let response = app
        .oneshot(request(
            "GET",
            &format!("{ASSET}/history?pageToken=yesterday"),
            "alice",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "bad_request");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn same_state_action_is_a_noop(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);

    let response = app
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/lifecycle.setState"),
            "alice",
            Some(json!({"params": {"state": "draft"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["noop"], true);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dry_run_reports_without_mutating(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("{ASSET}/actions/lifecycle.setState"),
            "alice",
            Some(json!({"dryRun": true, "params": {"state": "approved"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "dry-run");
    assert_eq!(body["data"]["to"], "approved");

    let response = app
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["lifecycleState"], "draft");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn delete_then_get_recreates_default(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);

    let response = app
        .clone()
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("DELETE", ASSET, "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request("GET", ASSET, "bob", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["lifecycleState"], "draft");
    assert_eq!(body["lifecycleChangedBy"], "bob");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn deny_all_authorizer_closes_every_route(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let settings = Arc::new(GovernanceSettings::default());
    let promotion = PromotionHandler::new(settings.clone(), None);
    let dispatcher = ActionDispatcher::new(settings, Some(promotion));
    let app = Router::new()
        .merge(api_routes())
        .layer(Extension(pool))
        .layer(Extension(Arc::new(
            catalog_governance::authz::DenyAllAuthorizer,
        ) as Arc<dyn catalog_governance::authz::Authorizer>))
        .layer(Extension(dispatcher))
        .layer(Extension(RefreshQueue { enabled: true }));

    let response = app
        .oneshot(request("GET", ASSET, "alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "forbidden");
}
