//! Service status, landing and session teardown endpoints.

use crate::error::{AppError, AppResult};
use crate::session::{RegistryStatus, RemovalReason};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub registry: RegistryStatus,
    pub status: &'static str,
}

/// `GET /api/status`
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        registry: state.registry.status(),
        status: "running",
    })
}

/// `GET /`
pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Welcome to Wilbur AI - Idiom Interpreter & Translator",
        "status": "running"
    }))
}

/// `DELETE /api/sessions/{pc_id}`
pub async fn remove_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let pc_id = path.into_inner();
    info!(pc_id = %pc_id, "Session removal requested");

    if state.registry.remove(&pc_id, RemovalReason::Manual).await {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(AppError::NotFound(format!("no session with id '{}'", pc_id)))
    }
}
