mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::ts;
use serde_json::{json, Value};
use siot_server::app_state;
use siot_server::memory::MemoryStore;
use siot_server::rest::create_router;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

struct TestContext {
    app: Router,
    tenant_id: Uuid,
    device_id: Uuid,
    // keeps the evaluation queue open
    _jobs: mpsc::Receiver<siot_server::evaluator::EvaluationJob>,
}

fn setup() -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let tenant_id = Uuid::new_v4();
    let device_id = store.add_device(tenant_id, "weather-station");
    let (tx, jobs) = mpsc::channel(64);
    TestContext {
        app: create_router(app_state(store, tx)),
        tenant_id,
        device_id,
        _jobs: jobs,
    }
}

impl TestContext {
    fn device_uri(&self, rest: &str) -> String {
        format!("/api/{}/devices/{}{}", self.tenant_id, self.device_id, rest)
    }

    fn rules_uri(&self, rest: &str) -> String {
        format!("/api/{}/rules{}", self.tenant_id, rest)
    }

    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let req = builder.body(body).expect("request should build");

        let resp = self
            .app
            .clone()
            .oneshot(req)
            .await
            .expect("request should be handled");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
        };
        (status, json)
    }

    async fn post_data(&self, data: Value) -> (StatusCode, Value) {
        self.request("POST", &self.device_uri("/data"), Some(json!({ "data": data })))
            .await
    }

    async fn sensor_id(&self, name: &str) -> String {
        let (_, body) = self.request("GET", &self.device_uri("/sensors"), None).await;
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == name)
            .map(|s| s["id"].as_str().unwrap().to_string())
            .expect("sensor should exist")
    }
}

#[tokio::test]
async fn test_ingest_then_query() {
    let ctx = setup();
    let (status, _) = ctx
        .post_data(json!([
            {"temp": 20.5, "humidity": 40, "collected_at": ts(20)},
            {"temp": 21.0, "collected_at": ts(10)}
        ]))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = ctx
        .request("GET", &ctx.device_uri("/data?sensors=temp"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert!(data.iter().all(|d| d.get("humidity").is_none() && d.get("collected_at").is_some()));

    let (_, body) = ctx
        .request("GET", &ctx.device_uri("/data?sensors=temp&sensors=humidity&limit=1&page=2"), None)
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["temp"], json!(21.0));
}

#[tokio::test]
async fn test_query_empty_device_returns_empty_array() {
    let ctx = setup();
    let (status, body) = ctx.request("GET", &ctx.device_uri("/data"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": []}));
}

#[tokio::test]
async fn test_ingest_validation_errors() {
    let ctx = setup();
    let (status, body) = ctx
        .post_data(json!([
            {"temp": 20, "collected_at": ts(20)},
            {"temp": 21}
        ]))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body, json!({"errors": ["collect date is missing"]}));

    let (status, body) = ctx
        .post_data(json!([{"temp": 20, "collected_at": "2024-01-01 10:00:00"}]))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0], "collect date is in the wrong format");

    let (status, body) = ctx.post_data(json!([])).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0], "data is required");

    let (_, body) = ctx.request("GET", &ctx.device_uri("/data"), None).await;
    assert_eq!(body, json!({"data": []}));
}

#[tokio::test]
async fn test_unknown_device_and_foreign_tenant_are_not_found() {
    let ctx = setup();
    let uri = format!("/api/{}/devices/{}/data", ctx.tenant_id, Uuid::new_v4());
    let (status, _) = ctx
        .request("POST", &uri, Some(json!({"data": [{"t": 1, "collected_at": ts(1)}]})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/api/{}/devices/{}/sensors", Uuid::new_v4(), ctx.device_id);
    let (status, body) = ctx.request("GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["errors"].is_array());
}

#[tokio::test]
async fn test_inactive_sensor_blocks_ingestion() {
    let ctx = setup();
    let (status, _) = ctx
        .request(
            "POST",
            &ctx.device_uri("/sensors"),
            Some(json!({"name": "pressure", "unit": "hPa", "status": "inactive"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = ctx
        .post_data(json!([{"pressure": 1013, "collected_at": ts(5)}]))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["errors"][0],
        "You can't send data with sensor pressure because is inactive"
    );
}

#[tokio::test]
async fn test_sensor_crud() {
    let ctx = setup();
    let (status, created) = ctx
        .request(
            "POST",
            &ctx.device_uri("/sensors"),
            Some(json!({"name": " temp ", "description": "air", "unit": "C"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "temp");
    assert_eq!(created["status"], "active");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = ctx
        .request("POST", &ctx.device_uri("/sensors"), Some(json!({"name": "temp"})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["errors"].is_array());

    let (status, body) = ctx
        .request("POST", &ctx.device_uri("/sensors"), Some(json!({"unit": "C"})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0], "name is required");

    let (status, shown) = ctx
        .request("GET", &ctx.device_uri(&format!("/sensors/{id}")), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shown["unit"], "C");

    let (status, updated) = ctx
        .request(
            "PUT",
            &ctx.device_uri(&format!("/sensors/{id}")),
            Some(json!({"name": "temp", "unit": "F", "status": "inactive"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["unit"], "F");
    assert_eq!(updated["status"], "inactive");

    let (status, _) = ctx
        .request("DELETE", &ctx.device_uri(&format!("/sensors/{id}")), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = ctx
        .request("GET", &ctx.device_uri(&format!("/sensors/{id}")), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sensor_listing_is_paginated() {
    let ctx = setup();
    ctx.post_data(json!([{"a": 1, "b": 2, "c": 3, "collected_at": ts(5)}]))
        .await;

    let (status, body) = ctx
        .request("GET", &ctx.device_uri("/sensors?limit=2&page=2"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_records"], 3);
    assert_eq!(body["total_pages"], 2);
    assert_eq!(body["page"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = ctx
        .request("GET", &ctx.device_uri("/sensors?limit=2&page=3"), None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0], "exceeded the number of pages");
}

#[tokio::test]
async fn test_sensor_rename_is_visible_in_queries() {
    let ctx = setup();
    ctx.post_data(json!([
        {"temp": 20, "collected_at": ts(20)},
        {"temp": 21, "collected_at": ts(10)}
    ]))
    .await;
    let id = ctx.sensor_id("temp").await;

    let (status, _) = ctx
        .request(
            "PUT",
            &ctx.device_uri(&format!("/sensors/{id}")),
            Some(json!({"name": "temperature"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = ctx
        .request("GET", &ctx.device_uri("/data?sensors=temperature"), None)
        .await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert!(data.iter().all(|d| d.get("temperature").is_some() && d.get("temp").is_none()));
}

#[tokio::test]
async fn test_rule_crud() {
    let ctx = setup();
    ctx.post_data(json!([{"temp": 20, "collected_at": ts(5)}])).await;

    let (status, body) = ctx
        .request(
            "POST",
            &ctx.rules_uri(""),
            Some(json!({"device_id": ctx.device_id, "sensor": "temp", "count_latest": 3})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e.as_str())
        .collect();
    assert!(errors.contains(&"value is required"));
    assert!(errors.contains(&"operator is required"));
    assert!(errors.contains(&"operation is required"));

    let (status, rule) = ctx
        .request(
            "POST",
            &ctx.rules_uri(""),
            Some(json!({
                "device_id": ctx.device_id,
                "sensor": "temp",
                "operator": "gt",
                "value": "40",
                "email": "ops@example.com",
                "email_subject": "$sensor is $value",
                "time_between_notification": "5m"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rule["operator"], "gt");
    assert_eq!(rule["count_latest"], 1);
    assert_eq!(rule["status"], "active");
    let id = rule["id"].as_str().unwrap().to_string();

    let (status, body) = ctx.request("GET", &ctx.rules_uri(""), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_records"], 1);

    let (status, updated) = ctx
        .request(
            "PUT",
            &ctx.rules_uri(&format!("/{id}")),
            Some(json!({
                "device_id": ctx.device_id,
                "sensor": "temp",
                "operator": "lt",
                "value": "0",
                "status": "inactive"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["id"], id.as_str());
    assert_eq!(updated["operator"], "lt");
    assert_eq!(updated["status"], "inactive");

    let other_tenant = format!("/api/{}/rules/{id}", Uuid::new_v4());
    let (status, _) = ctx.request("GET", &other_tenant, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = ctx
        .request("DELETE", &ctx.rules_uri(&format!("/{id}")), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = ctx.request("GET", &ctx.rules_uri(&format!("/{id}")), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = ctx
        .request("DELETE", &ctx.rules_uri(&format!("/{id}")), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_json_is_unprocessable() {
    let ctx = setup();
    let req = Request::builder()
        .method("POST")
        .uri(ctx.device_uri("/data"))
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = ctx.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_malformed_path_id_is_unprocessable() {
    let ctx = setup();

    let (status, body) = ctx.request("GET", "/api/not-a-uuid/rules", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = body["errors"].as_array().expect("errors array");
    assert_eq!(errors.len(), 1);

    let uri = format!("/api/{}/devices/{}/sensors/42", ctx.tenant_id, ctx.device_id);
    let (status, body) = ctx.request("GET", &uri, None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["errors"].is_array());
}
