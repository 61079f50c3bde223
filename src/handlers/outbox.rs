use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::context::Context;
use crate::domain::outbox::{OutboxRecord, OutboxStats, OutboxStatus};
use crate::domain::ports::EventStore;
use crate::errors::AppError;
use crate::infrastructure::pg_store::PgEventStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(OpenApi)]
#[openapi(
    paths(get_stats, list_stuck, get_event),
    components(schemas(OutboxStats, OutboxRecord, OutboxStatus)),
    tags((name = "outbox", description = "Outbox relay inspection"))
)]
pub struct ApiDoc;

#[derive(Debug, Deserialize, IntoParams)]
pub struct StuckParams {
    /// Maximum number of records. Defaults to 20, maximum 100.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// GET /outbox/stats
#[utoipa::path(
    get,
    path = "/outbox/stats",
    responses(
        (status = 200, description = "Outbox counts by status", body = OutboxStats),
        (status = 503, description = "Outbox store unavailable"),
    ),
    tag = "outbox"
)]
pub async fn get_stats(store: web::Data<Arc<PgEventStore>>) -> Result<HttpResponse, AppError> {
    let stats = web::block(move || store.stats(&Context::with_timeout(REQUEST_TIMEOUT)))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(HttpResponse::Ok().json(stats))
}

/// GET /outbox/stuck
///
/// Lists unpublished records that reached the error ceiling and are no
/// longer retried, oldest first.
#[utoipa::path(
    get,
    path = "/outbox/stuck",
    params(StuckParams),
    responses(
        (status = 200, description = "Stuck outbox records", body = Vec<OutboxRecord>),
        (status = 503, description = "Outbox store unavailable"),
    ),
    tag = "outbox"
)]
pub async fn list_stuck(
    store: web::Data<Arc<PgEventStore>>,
    query: web::Query<StuckParams>,
) -> Result<HttpResponse, AppError> {
    let limit = query.into_inner().limit.clamp(1, 100);

    let records = web::block(move || {
        store.get_stuck_messages(&Context::with_timeout(REQUEST_TIMEOUT), limit)
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(HttpResponse::Ok().json(records))
}

/// GET /outbox/{id}
#[utoipa::path(
    get,
    path = "/outbox/{id}",
    params(
        ("id" = Uuid, Path, description = "Outbox record id"),
    ),
    responses(
        (status = 200, description = "Outbox record found", body = OutboxRecord),
        (status = 404, description = "Outbox record not found"),
        (status = 503, description = "Outbox store unavailable"),
    ),
    tag = "outbox"
)]
pub async fn get_event(
    store: web::Data<Arc<PgEventStore>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();

    let record = web::block(move || store.get_record(&Context::with_timeout(REQUEST_TIMEOUT), id))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    match record {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(AppError::NotFound),
    }
}

pub async fn openapi_json() -> HttpResponse {
    HttpResponse::Ok().json(ApiDoc::openapi())
}
