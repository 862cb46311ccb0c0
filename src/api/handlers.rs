use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::*;
use crate::model::*;

use super::AppState;
use super::dto::*;
use super::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

async fn engine(state: &AppState, tenant: &str) -> ApiResult<Arc<Engine>> {
    Ok(state.tenants.get_or_create(tenant).await?)
}

fn parse_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw).map_err(|_| ApiError::bad_request(format!("invalid id: {raw:?}")))
}

/// Slot generation is bounded so one huge scan can't pin a worker.
async fn within<T>(limit: Duration, work: impl Future<Output = Result<T, EngineError>>) -> ApiResult<T> {
    match tokio::time::timeout(limit, work).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ApiError::timeout()),
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Providers ────────────────────────────────────────────

pub async fn create_provider(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<CreateProvider>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ProviderInfo>)> {
    let Json(body) = body?;
    let info = engine(&state, &tenant).await?
        .register_provider(NewProvider {
            id: body.id.unwrap_or_else(Ulid::new),
            kind: body.kind,
            name: body.name,
            chapter: body.chapter,
            buffer_after: body.buffer_after,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_providers(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    query: Result<Query<ProviderListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ProviderInfo>>> {
    let Query(query) = query?;
    let providers = engine(&state, &tenant).await?
        .list_providers(query.kind, query.chapter.as_deref())
        .await;
    Ok(Json(providers))
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Json<ProviderInfo>> {
    let id = parse_id(&id)?;
    Ok(Json(engine(&state, &tenant).await?.provider_info(id).await?))
}

pub async fn update_provider(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    body: Result<Json<UpdateProvider>, JsonRejection>,
) -> ApiResult<Json<ProviderInfo>> {
    let id = parse_id(&id)?;
    let Json(body) = body?;
    let update = ProviderUpdate {
        name: body.name,
        chapter: body.chapter,
        buffer_after: body.buffer_after,
        active: body.active,
    };
    Ok(Json(engine(&state, &tenant).await?.update_provider(id, update).await?))
}

pub async fn remove_provider(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    engine(&state, &tenant).await?.remove_provider(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn provider_schedule(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    query: Result<Query<ScheduleQuery>, QueryRejection>,
) -> ApiResult<Json<ProviderSchedule>> {
    let id = parse_id(&id)?;
    let Query(query) = query?;
    Ok(Json(
        engine(&state, &tenant).await?
            .provider_schedule(id, query.day_of_week)
            .await?,
    ))
}

// ── Weekly rules ─────────────────────────────────────────

pub async fn add_window(
    State(state): State<AppState>,
    Path((tenant, provider_id)): Path<(String, String)>,
    body: Result<Json<CreateWindow>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AvailabilityWindow>)> {
    let provider_id = parse_id(&provider_id)?;
    let Json(body) = body?;
    let window = engine(&state, &tenant).await?
        .add_window(NewWindow {
            id: body.id.unwrap_or_else(Ulid::new),
            provider_id,
            day_of_week: body.day_of_week,
            start_time: body.start_time,
            end_time: body.end_time,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(window)))
}

pub async fn add_break(
    State(state): State<AppState>,
    Path((tenant, provider_id)): Path<(String, String)>,
    body: Result<Json<CreateBreak>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BreakInterval>)> {
    let provider_id = parse_id(&provider_id)?;
    let Json(body) = body?;
    let brk = engine(&state, &tenant).await?
        .add_break(NewBreak {
            id: body.id.unwrap_or_else(Ulid::new),
            provider_id,
            day_of_week: body.day_of_week,
            start_time: body.start_time,
            end_time: body.end_time,
            kind: body.kind,
            label: body.label,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(brk)))
}

async fn toggle_rule(
    state: AppState,
    tenant: String,
    id: String,
    kind: RuleKind,
    body: Result<Json<ToggleRule>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let Json(body) = body?;
    let provider_id = engine(&state, &tenant).await?
        .set_rule_active(id, kind, body.active)
        .await?;
    Ok(Json(json!({ "id": id, "provider_id": provider_id, "active": body.active })))
}

async fn delete_rule(state: AppState, tenant: String, id: String, kind: RuleKind) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    engine(&state, &tenant).await?.remove_rule(id, kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_window(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    body: Result<Json<ToggleRule>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    toggle_rule(state, tenant, id, RuleKind::Window, body).await
}

pub async fn remove_window(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    delete_rule(state, tenant, id, RuleKind::Window).await
}

pub async fn toggle_break(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    body: Result<Json<ToggleRule>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    toggle_rule(state, tenant, id, RuleKind::Break, body).await
}

pub async fn remove_break(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    delete_rule(state, tenant, id, RuleKind::Break).await
}

// ── Slots ────────────────────────────────────────────────

pub async fn provider_slots(
    State(state): State<AppState>,
    Path((tenant, provider_id)): Path<(String, String)>,
    query: Result<Query<SlotsQuery>, QueryRejection>,
) -> ApiResult<Json<SlotReport>> {
    let provider_id = parse_id(&provider_id)?;
    let Query(query) = query?;
    let engine = engine(&state, &tenant).await?;
    let request = SlotRequest {
        provider_id,
        base_date: query.base_date,
        duration: query.duration_minutes,
        suggestion_type: query.suggestion_type,
        max_per_day: query.max_per_day,
    };
    let report = within(state.request_timeout, engine.generate_slots(request)).await?;
    Ok(Json(report))
}

pub async fn chapter_slots(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    query: Result<Query<ChapterSlotsQuery>, QueryRejection>,
) -> ApiResult<Json<SlotReport>> {
    let Query(query) = query?;
    let engine = engine(&state, &tenant).await?;
    let request = ChapterSlotRequest {
        chapter: query.chapter,
        kind: query.kind,
        base_date: query.base_date,
        duration: query.duration_minutes,
        suggestion_type: query.suggestion_type,
        max_per_day: query.max_per_day,
    };
    let report = within(state.request_timeout, engine.generate_chapter_slots(request)).await?;
    Ok(Json(report))
}

pub async fn check_slot(
    State(state): State<AppState>,
    Path((tenant, provider_id)): Path<(String, String)>,
    query: Result<Query<CheckSlotQuery>, QueryRejection>,
) -> ApiResult<Json<Slot>> {
    let provider_id = parse_id(&provider_id)?;
    let Query(query) = query?;
    let slot = engine(&state, &tenant).await?
        .check_slot(provider_id, query.date, query.start_time, query.duration_minutes)
        .await?;
    Ok(Json(slot))
}

pub async fn free_spans(
    State(state): State<AppState>,
    Path((tenant, provider_id)): Path<(String, String)>,
    query: Result<Query<DateQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let provider_id = parse_id(&provider_id)?;
    let Query(query) = query?;
    let spans = engine(&state, &tenant).await?
        .free_spans(provider_id, query.date)
        .await?;
    let free: Vec<Value> = spans
        .iter()
        .map(|s| json!({ "start_time": fmt_clock(s.start), "end_time": fmt_clock(s.end) }))
        .collect();
    Ok(Json(json!({
        "provider_id": provider_id,
        "date": query.date,
        "free": free,
    })))
}

// ── Bookings ─────────────────────────────────────────────

pub async fn create_booking(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<CreateBooking>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let Json(body) = body?;
    let booking = engine(&state, &tenant).await?
        .check_and_reserve(BookingRequest {
            id: body.id.unwrap_or_else(Ulid::new),
            provider_id: body.provider_id,
            date: body.date,
            start_time: body.start_time,
            duration: body.duration_minutes,
            label: body.label,
            allow_overbooking: body.allow_overbooking,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    query: Result<Query<BookingListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Booking>>> {
    let Query(query) = query?;
    let bookings = engine(&state, &tenant).await?
        .list_bookings(BookingFilter {
            provider_id: query.provider_id,
            from: query.from,
            to: query.to,
            include_cancelled: query.include_cancelled,
        })
        .await?;
    Ok(Json(bookings))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Json<Booking>> {
    let id = parse_id(&id)?;
    Ok(Json(engine(&state, &tenant).await?.get_booking(id).await?))
}

pub async fn update_booking_status(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    body: Result<Json<StatusChange>, JsonRejection>,
) -> ApiResult<Json<Booking>> {
    let id = parse_id(&id)?;
    let Json(body) = body?;
    Ok(Json(
        engine(&state, &tenant).await?
            .update_booking_status(id, body.status)
            .await?,
    ))
}

pub async fn reschedule_booking(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    body: Result<Json<Reschedule>, JsonRejection>,
) -> ApiResult<Json<Booking>> {
    let booking_id = parse_id(&id)?;
    let Json(body) = body?;
    let booking = engine(&state, &tenant).await?
        .reschedule_booking(RescheduleRequest {
            booking_id,
            date: body.date,
            start_time: body.start_time,
            duration: body.duration_minutes,
            allow_overbooking: body.allow_overbooking,
        })
        .await?;
    Ok(Json(booking))
}

// ── Event stream ─────────────────────────────────────────

/// Committed events as server-sent events. The stream ends when the provider
/// it follows is removed.
pub async fn events(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    query: Result<Query<EventStreamQuery>, QueryRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>> {
    let Query(query) = query?;
    let engine = engine(&state, &tenant).await?;
    let rx = match query.provider_id {
        Some(id) => {
            engine.provider_info(id).await?;
            engine.notify.subscribe(id)
        }
        None => engine.notify.subscribe_all(),
    };

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = SseEvent::default().event(event.kind()).json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
