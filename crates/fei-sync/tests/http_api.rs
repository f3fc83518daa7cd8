// File: fei-sync/tests/http_api.rs
// Purpose: HttpApi against a local axum server speaking the backend envelope

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fei_sync::{ApiError, ApiSettings, CollectionName, Fei, HttpApi, QueuedMutation, RemoteApi};

#[derive(Clone, Default)]
struct Seen {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    auth: Arc<Mutex<Option<String>>>,
    pushed: Arc<Mutex<Vec<Value>>>,
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "ok": true, "data": data, "error": "" }))
}

fn fei_json(numero: &str) -> Value {
    json!({
        "numero": numero,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-02T00:00:00Z",
        "deleted_at": null
    })
}

async fn now() -> Json<Value> {
    ok(json!({ "now": "2024-02-01T10:00:00.000Z" }))
}

async fn feis(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    *seen.auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.queries.lock().unwrap().push(query);
    ok(json!({ "items": [fei_json("A"), fei_json("B")] }))
}

async fn me() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "ok": false, "data": null, "error": "Unauthorized" })),
    )
}

async fn buckets() -> Json<Value> {
    ok(json!({
        "feisOngoing": [fei_json("A")],
        "feisToTake": [fei_json("A")],
        "feisUnderMyResponsability": []
    }))
}

async fn done() -> Json<Value> {
    ok(json!({ "feisDone": [fei_json("C")] }))
}

async fn detail(Path(numero): Path<String>) -> (StatusCode, Json<Value>) {
    if numero != "A" && numero != "ZA/2024?1" {
        return (StatusCode::BAD_GATEWAY, Json(json!("upstream exploded")));
    }
    (
        StatusCode::OK,
        ok(json!({ "fei": fei_json(&numero), "carcasses": [], "carcassesIntermediaires": [] })),
    )
}

async fn slow_now() -> Json<Value> {
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    ok(json!({ "now": "2024-02-01T10:00:00.000Z" }))
}

async fn push(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    let item = body["payload"].clone();
    seen.pushed.lock().unwrap().push(body);
    ok(json!({ "item": item }))
}

async fn serve() -> (HttpApi, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/now", get(now))
        .route("/feis", get(feis))
        .route("/feis/sync", post(push))
        .route("/user/me", get(me))
        .route("/fei", get(buckets))
        .route("/fei/done", get(done))
        .route("/fei/:numero", get(detail))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let api = HttpApi::new(&ApiSettings {
        base_url: format!("http://{addr}/"),
        api_key: Some("secret-token".to_string()),
        timeout_secs: 5,
    })
    .unwrap();
    (api, seen)
}

#[tokio::test]
async fn test_server_clock() {
    let (api, _) = serve().await;

    let now = api.now().await.unwrap();
    assert_eq!(now.to_rfc3339(), "2024-02-01T10:00:00+00:00");
}

#[tokio::test]
async fn test_fetch_since_sends_mark_and_credentials() {
    let (api, seen) = serve().await;

    let first = api.fetch_since(CollectionName::Feis, None).await.unwrap();
    let mark = api.now().await.unwrap();
    api.fetch_since(CollectionName::Feis, Some(mark)).await.unwrap();

    assert_eq!(first.len(), 2);
    let queries = seen.queries.lock().unwrap().clone();
    assert_eq!(queries[0].get("withDeleted").map(String::as_str), Some("true"));
    assert_eq!(queries[0].get("after"), None);
    assert_eq!(
        queries[1].get("after").map(String::as_str),
        Some("2024-02-01T10:00:00.000Z")
    );
    assert_eq!(
        seen.auth.lock().unwrap().as_deref(),
        Some("Bearer secret-token")
    );
}

#[tokio::test]
async fn test_refused_envelope_maps_to_status_error() {
    let (api, _) = serve().await;

    match api.fetch_profile().await {
        Err(ApiError::Status { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "Unauthorized");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_non_envelope_error_body_is_kept() {
    let (api, _) = serve().await;

    match api.fetch_fei_detail("Z").await {
        Err(ApiError::Status { status, message }) => {
            assert_eq!(status, 502);
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_buckets_are_flattened_with_duplicates() {
    let (api, _) = serve().await;

    let numeros: Vec<String> = api
        .fetch_fei_buckets()
        .await
        .unwrap()
        .into_all()
        .into_iter()
        .map(|f| f.numero)
        .collect();

    assert_eq!(numeros, vec!["A".to_string(), "A".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn test_push_mutation_round_trip() {
    let (api, seen) = serve().await;
    let record: Fei = serde_json::from_value(fei_json("A")).unwrap();
    let mutation = QueuedMutation::upsert(&record).unwrap();

    let accepted = api.push_mutation(&mutation).await.unwrap();

    assert_eq!(accepted.item.unwrap()["numero"], "A");
    let pushed = seen.pushed.lock().unwrap().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0]["kind"], "upsert");
    assert_eq!(pushed[0]["collection"], "feis");
    assert_eq!(pushed[0]["record_key"], "A");
}

#[tokio::test]
async fn test_fei_detail_keeps_reserved_characters_in_the_numero() {
    let (api, _) = serve().await;

    let detail = api.fetch_fei_detail("ZA/2024?1").await.unwrap();
    assert_eq!(detail.fei.numero, "ZA/2024?1");
}

#[tokio::test]
async fn test_slow_server_is_a_timeout() {
    let app = Router::new().route("/now", get(slow_now));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let api = HttpApi::new(&ApiSettings {
        base_url: format!("http://{addr}"),
        api_key: None,
        timeout_secs: 1,
    })
    .unwrap();

    let err = api.now().await.unwrap_err();
    assert!(err.is_timeout(), "unexpected: {err:?}");
    assert!(matches!(err, ApiError::Timeout(_)));
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpApi::new(&ApiSettings {
        base_url: format!("http://{addr}"),
        api_key: None,
        timeout_secs: 2,
    })
    .unwrap();

    assert!(matches!(api.now().await, Err(ApiError::Network(_))));
}
