//! 存储网关集成测试
//!
//! 用 axum 起一个本地 mock 存储端点，驱动真实的 reqwest 网关，
//! 验证重试、4xx 不重试、限流恢复与超时语义。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_json::{Value, json};

use credit_ledger::store::{Filter, Query, StoreBackend, StoreGateway, collections};
use credits_shared::config::{RetryConfig, StoreConfig};
use credits_shared::error::CreditError;

/// mock 存储的共享状态：各端点的命中计数
#[derive(Clone, Default)]
struct MockState {
    flaky_hits: Arc<AtomicU32>,
    limited_hits: Arc<AtomicU32>,
    invalid_hits: Arc<AtomicU32>,
}

async fn users_handler() -> Json<Value> {
    Json(json!([{
        "user_id": "u-1",
        "username": "alice",
        "credits": 10,
        "is_admin": false,
        "created_at": "2026-08-01T00:00:00Z"
    }]))
}

async fn users_insert_handler(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    // 与真实存储一致：return=representation 回显插入的行
    (StatusCode::CREATED, Json(json!([body])))
}

/// 前两次返回 500，之后恢复
async fn flaky_handler(State(state): State<MockState>) -> (StatusCode, String) {
    let n = state.flaky_hits.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
    } else {
        (StatusCode::OK, "[]".to_string())
    }
}

/// 首次返回 429，之后恢复
async fn limited_handler(State(state): State<MockState>) -> (StatusCode, String) {
    let n = state.limited_hits.fetch_add(1, Ordering::SeqCst);
    if n == 0 {
        (StatusCode::TOO_MANY_REQUESTS, "rate limited".to_string())
    } else {
        (StatusCode::OK, "[]".to_string())
    }
}

/// 始终返回 400 校验错误
async fn invalid_handler(State(state): State<MockState>) -> (StatusCode, String) {
    state.invalid_hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_REQUEST, "validation failed".to_string())
}

/// 超过客户端超时上限才响应
async fn slow_handler() -> String {
    tokio::time::sleep(Duration::from_secs(3)).await;
    "[]".to_string()
}

async fn spawn_mock_store(state: MockState) -> String {
    let app = Router::new()
        .route(
            "/rest/v1/users",
            get(users_handler).post(users_insert_handler),
        )
        .route("/rest/v1/flaky", get(flaky_handler))
        .route("/rest/v1/limited", get(limited_handler))
        .route("/rest/v1/invalid", get(invalid_handler))
        .route("/rest/v1/slow", get(slow_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway_config(url: String) -> StoreConfig {
    StoreConfig {
        url,
        api_key: "test-anon-key".to_string(),
        service_key: "test-service-key".to_string(),
        timeout_seconds: 1,
        slow_request_threshold_ms: 2_000,
        retry: RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            multiplier: 2.0,
        },
    }
}

#[tokio::test]
async fn test_select_returns_typed_rows() {
    let url = spawn_mock_store(MockState::default()).await;
    let gateway = StoreGateway::new(&gateway_config(url)).unwrap();

    let rows = gateway
        .select(
            collections::USERS,
            Query::new().filter(Filter::eq("user_id", "u-1")),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["username"], "alice");
    assert_eq!(rows[0]["credits"], 10);
}

#[tokio::test]
async fn test_insert_returns_representation() {
    let url = spawn_mock_store(MockState::default()).await;
    let gateway = StoreGateway::new(&gateway_config(url)).unwrap();

    let rows = gateway
        .insert(collections::USERS, json!({"user_id": "u-2", "credits": 0}))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["user_id"], "u-2");
}

#[tokio::test]
async fn test_transient_500_retried_until_success() {
    let state = MockState::default();
    let url = spawn_mock_store(state.clone()).await;
    let gateway = StoreGateway::new(&gateway_config(url)).unwrap();

    let rows = gateway.select("flaky", Query::new()).await.unwrap();

    assert!(rows.is_empty());
    // 两次失败 + 一次成功
    assert_eq!(state.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rate_limit_429_retried() {
    let state = MockState::default();
    let url = spawn_mock_store(state.clone()).await;
    let gateway = StoreGateway::new(&gateway_config(url)).unwrap();

    let rows = gateway.select("limited", Query::new()).await.unwrap();

    assert!(rows.is_empty());
    assert_eq!(state.limited_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let state = MockState::default();
    let url = spawn_mock_store(state.clone()).await;
    let gateway = StoreGateway::new(&gateway_config(url)).unwrap();

    let err = gateway.select("invalid", Query::new()).await.unwrap_err();

    assert!(matches!(
        err,
        CreditError::StoreRejected { status: 400, .. }
    ));
    // 4xx 校验错误只发出一次请求
    assert_eq!(state.invalid_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_last_error() {
    let url = spawn_mock_store(MockState::default()).await;
    let mut config = gateway_config(url);
    config.retry.max_retries = 1;
    let gateway = StoreGateway::new(&config).unwrap();

    // flaky 前两次返回 500，重试预算只有 1 次，应以失败值收场
    let err = gateway.select("flaky", Query::new()).await.unwrap_err();
    assert!(matches!(
        err,
        CreditError::StoreUnavailable {
            status: Some(500),
            ..
        }
    ));
}

#[tokio::test]
async fn test_timeout_surfaces_as_error_value() {
    let url = spawn_mock_store(MockState::default()).await;
    let mut config = gateway_config(url);
    config.retry.max_retries = 0;
    let gateway = StoreGateway::new(&config).unwrap();

    let start = Instant::now();
    let err = gateway.select("slow", Query::new()).await.unwrap_err();

    assert!(matches!(err, CreditError::StoreTimeout));
    // 操作在超时上限附近返回，不会无限挂起
    assert!(start.elapsed() < Duration::from_secs(3));
}
