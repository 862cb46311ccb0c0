use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::NaiveDate;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

use slotbook::api::{self, AppState};
use slotbook::clock::FixedClock;
use slotbook::policy::SlotPolicy;
use slotbook::tenant::{TenantManager, TenantOptions};

// ── Test infrastructure ──────────────────────────────────────

/// Router over a fresh data dir, frozen at Sunday 2026-03-01 08:00.
fn test_app() -> Router {
    let dir = std::env::temp_dir().join(format!("slotbook_api_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let sunday = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let options = TenantOptions {
        compact_threshold: 1000,
        compact_interval: Duration::from_secs(3600),
        policy: SlotPolicy::default(),
        clock: Arc::new(FixedClock::at(sunday, 8, 0)),
    };
    let tenants = Arc::new(TenantManager::new(dir, options));
    api::router(AppState::new(tenants, Duration::from_secs(5), 64))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Doctor working Mondays 09:00-17:00 with lunch 12:00-13:00.
async fn monday_doctor(app: &Router, tenant: &str) -> String {
    let (status, provider) = call(
        app,
        Method::POST,
        &format!("/tenants/{tenant}/providers"),
        Some(json!({ "kind": "doctor", "name": "Dr. Okafor", "chapter": "north" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = provider["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        app,
        Method::POST,
        &format!("/tenants/{tenant}/providers/{id}/windows"),
        Some(json!({ "day_of_week": 1, "start_time": "09:00", "end_time": "17:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        app,
        Method::POST,
        &format!("/tenants/{tenant}/providers/{id}/breaks"),
        Some(json!({ "day_of_week": 1, "start_time": "12:00", "end_time": "13:00", "kind": "lunch" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    id
}

async fn book(app: &Router, tenant: &str, provider: &str, start: &str) -> (StatusCode, Value) {
    call(
        app,
        Method::POST,
        &format!("/tenants/{tenant}/bookings"),
        Some(json!({
            "provider_id": provider,
            "date": "2026-03-02",
            "start_time": start,
            "duration_minutes": 30,
        })),
    )
    .await
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_ok() {
    let app = test_app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn slots_skip_lunch_and_booked_times() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;

    let (status, _) = book(&app, "clinic_a", &doc, "09:00").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, report) = call(
        &app,
        Method::GET,
        &format!("/tenants/clinic_a/providers/{doc}/slots?base_date=2026-03-02&duration_minutes=30"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["range_start"], "2026-03-02");
    assert_eq!(report["range_end"], "2026-03-09");

    let monday = report["days"]
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["date"] == "2026-03-02")
        .unwrap();
    let starts: Vec<&str> = monday["slots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["start_time"].as_str().unwrap())
        .collect();
    assert_eq!(starts.first(), Some(&"09:30"));
    assert!(!starts.contains(&"12:00"));
    assert!(!starts.contains(&"12:30"));
    assert!(starts.contains(&"13:00"));
    assert_eq!(report["next_available"][0]["start_time"], "09:30");
}

#[tokio::test]
async fn double_booking_returns_conflict_with_details() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;

    let (status, first) = book(&app, "clinic_a", &doc, "10:00").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "pending");
    assert_eq!(first["end_time"], "10:30");

    let (status, err) = book(&app, "clinic_a", &doc, "10:15").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "conflict");
    assert_eq!(err["details"]["reasons"][0]["kind"], "overlaps_booking");
    assert_eq!(err["details"]["reasons"][0]["booking_id"], first["id"]);
    assert_eq!(err["details"]["next_available"]["start_time"], "09:00");

    // Lunch is outside the bookable shape.
    let (status, err) = book(&app, "clinic_a", &doc, "12:15").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["details"]["reasons"][0]["kind"], "overlaps_break");
}

#[tokio::test]
async fn overbooking_override_commits() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    book(&app, "clinic_a", &doc, "10:00").await;

    let (status, booking) = call(
        &app,
        Method::POST,
        "/tenants/clinic_a/bookings",
        Some(json!({
            "provider_id": doc,
            "date": "2026-03-02",
            "start_time": "10:00",
            "allow_overbooking": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booking["overbooked"], true);
}

#[tokio::test]
async fn tenants_are_isolated() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;

    let (status, _) = call(&app, Method::GET, &format!("/tenants/clinic_b/providers/{doc}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, list) = call(&app, Method::GET, "/tenants/clinic_b/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn bad_ids_and_unknown_entities() {
    let app = test_app();
    let (status, err) = call(&app, Method::GET, "/tenants/clinic_a/bookings/not-a-ulid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "validation_error");

    let missing = Ulid::new();
    let (status, err) = call(&app, Method::GET, &format!("/tenants/clinic_a/bookings/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "not_found");

    let (status, err) = call(&app, Method::GET, "/tenants/bad.name/providers", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "invalid_tenant");
}

#[tokio::test]
async fn malformed_times_are_rejected() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/tenants/clinic_a/providers/{doc}/windows"),
        Some(json!({ "day_of_week": 2, "start_time": "nine", "end_time": "17:00" })),
    )
    .await;
    assert!(status.is_client_error());

    let (status, err) = call(
        &app,
        Method::POST,
        &format!("/tenants/clinic_a/providers/{doc}/windows"),
        Some(json!({ "day_of_week": 2, "start_time": "17:00", "end_time": "09:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "validation_error");
}

#[tokio::test]
async fn status_lifecycle_and_invalid_move() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    let (_, booking) = book(&app, "clinic_a", &doc, "14:00").await;
    let id = booking["id"].as_str().unwrap();

    let (status, err) = call(
        &app,
        Method::PATCH,
        &format!("/tenants/clinic_a/bookings/{id}/status"),
        Some(json!({ "status": "completed" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["code"], "invalid_transition");

    let (status, confirmed) = call(
        &app,
        Method::PATCH,
        &format!("/tenants/clinic_a/bookings/{id}/status"),
        Some(json!({ "status": "confirmed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");

    let (status, cancelled) = call(
        &app,
        Method::PATCH,
        &format!("/tenants/clinic_a/bookings/{id}/status"),
        Some(json!({ "status": "cancelled" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    // The freed interval can be taken again.
    let (status, _) = book(&app, "clinic_a", &doc, "14:00").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn reschedule_moves_booking() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    let (_, booking) = book(&app, "clinic_a", &doc, "09:00").await;
    let id = booking["id"].as_str().unwrap();

    let (status, moved) = call(
        &app,
        Method::POST,
        &format!("/tenants/clinic_a/bookings/{id}/reschedule"),
        Some(json!({ "date": "2026-03-02", "start_time": "09:15" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["start_time"], "09:15");
    assert_eq!(moved["end_time"], "09:45");

    let (status, _) = book(&app, "clinic_a", &doc, "09:00").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = book(&app, "clinic_a", &doc, "09:45").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn check_slot_and_free_spans() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    book(&app, "clinic_a", &doc, "09:00").await;

    let (status, slot) = call(
        &app,
        Method::GET,
        &format!("/tenants/clinic_a/providers/{doc}/slots/check?date=2026-03-02&start_time=09:00"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slot["available"], false);
    assert_eq!(slot["conflicts"][0]["kind"], "overlaps_booking");

    let (status, free) = call(
        &app,
        Method::GET,
        &format!("/tenants/clinic_a/providers/{doc}/free?date=2026-03-02"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        free["free"],
        json!([
            { "start_time": "09:30", "end_time": "12:00" },
            { "start_time": "13:00", "end_time": "17:00" },
        ])
    );
}

#[tokio::test]
async fn chapter_slots_merge_providers() {
    let app = test_app();
    let a = monday_doctor(&app, "clinic_a").await;
    let b = monday_doctor(&app, "clinic_a").await;
    book(&app, "clinic_a", &a, "09:00").await;

    let (status, report) = call(
        &app,
        Method::GET,
        "/tenants/clinic_a/slots?chapter=north&base_date=2026-03-02&suggestion_type=next_week",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first = &report["next_available"][0];
    assert_eq!(first["start_time"], "09:00");
    assert_eq!(first["provider_id"], b.as_str());

    let (status, err) = call(&app, Method::GET, "/tenants/clinic_a/slots?chapter=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "validation_error");
}

#[tokio::test]
async fn provider_with_bookings_cannot_be_removed() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    book(&app, "clinic_a", &doc, "11:00").await;

    let (status, err) = call(&app, Method::DELETE, &format!("/tenants/clinic_a/providers/{doc}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "has_bookings");

    let (status, _) = call(
        &app,
        Method::POST,
        "/tenants/clinic_a/providers",
        Some(json!({ "kind": "member" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, list) = call(&app, Method::GET, "/tenants/clinic_a/providers?kind=member", None).await;
    let member = list[0]["id"].as_str().unwrap().to_string();
    let (status, _) = call(&app, Method::DELETE, &format!("/tenants/clinic_a/providers/{member}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn patch_null_clears_provider_fields() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;
    let uri = format!("/tenants/clinic_a/providers/{doc}");

    let (status, info) = call(&app, Method::PATCH, &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["name"], "Dr. Okafor");
    assert_eq!(info["chapter"], "north");

    let (status, info) = call(&app, Method::PATCH, &uri, Some(json!({ "chapter": null }))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(info["chapter"].is_null());
    assert_eq!(info["name"], "Dr. Okafor");

    let (_, north) = call(&app, Method::GET, "/tenants/clinic_a/providers?chapter=north", None).await;
    assert!(north.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn event_stream_delivers_committed_bookings() {
    let app = test_app();
    let doc = monday_doctor(&app, "clinic_a").await;

    let request = Request::builder()
        .uri(format!("/tenants/clinic_a/events?provider_id={doc}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let mut body = response.into_body().into_data_stream();

    let (status, booking) = book(&app, "clinic_a", &doc, "09:00").await;
    assert_eq!(status, StatusCode::CREATED);
    let booking_id = booking["id"].as_str().unwrap();

    let mut seen = String::new();
    while !seen.contains("booking_created") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event within timeout")
            .expect("stream still open")
            .unwrap();
        seen.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert!(seen.contains(booking_id));
}

#[tokio::test]
async fn event_stream_for_unknown_provider_is_not_found() {
    let app = test_app();
    let (status, err) = call(
        &app,
        Method::GET,
        &format!("/tenants/clinic_a/events?provider_id={}", Ulid::new()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "not_found");
}
