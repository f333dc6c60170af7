//! # Signaling Endpoint
//!
//! `POST /api/offer` exchanges SDP with the browser.
//!
//! ## Flow:
//! 1. An offer carrying the `pc_id` of a live session renegotiates that
//!    connection and returns its updated answer
//! 2. Anything else (no `pc_id`, or one the registry no longer knows) creates a
//!    new connection, spawns its translation worker and registers the pair
//!
//! Language selection comes from the query string (`language` is the target,
//! `sourceLanguage` what the client speaks). Unknown codes fall back to the
//! configured defaults.

use crate::connection::{PeerConnection, SdpAnswer, SessionDescription};
use crate::error::{AppError, AppResult};
use crate::session::RegistryError;
use crate::state::AppState;
use crate::worker::language::Language;
use crate::worker::{WorkerConfig, WorkerHandle};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    /// Set when the client renegotiates an existing connection
    pub pc_id: Option<String>,
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Request an ICE restart on renegotiation
    #[serde(default)]
    pub restart_pc: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LanguageQuery {
    pub language: Option<String>,
    #[serde(rename = "sourceLanguage")]
    pub source_language: Option<String>,
}

pub async fn offer(
    state: web::Data<AppState>,
    query: web::Query<LanguageQuery>,
    body: web::Json<OfferRequest>,
) -> AppResult<HttpResponse> {
    match negotiate(&state, query.into_inner(), body.into_inner()).await {
        Ok(answer) => Ok(HttpResponse::Ok().json(answer)),
        Err(err) => {
            state.record_offer_failure();
            warn!("Offer rejected: {}", err);
            Err(err)
        }
    }
}

async fn negotiate(
    state: &AppState,
    query: LanguageQuery,
    request: OfferRequest,
) -> AppResult<SdpAnswer> {
    let description = SessionDescription {
        sdp: request.sdp,
        kind: request.kind,
    };

    if let Some(pc_id) = request.pc_id.as_deref() {
        if let Some(connection) = state.registry.lookup(pc_id) {
            info!(pc_id = %pc_id, restart = request.restart_pc, "Reusing existing connection");
            connection
                .renegotiate(description, request.restart_pc)
                .await?;
            state.record_renegotiation();
            return local_answer(connection.as_ref());
        }
        debug!(pc_id = %pc_id, "Unknown pc_id, creating a new connection");
    }

    if !state.registry.has_capacity() {
        let err = if state.registry.is_closed() {
            RegistryError::ShuttingDown
        } else {
            RegistryError::AtCapacity {
                limit: state.registry.config().max_sessions,
            }
        };
        return Err(err.into());
    }

    let connection = state.connections.create(description).await?;
    let pc_id = connection.pc_id().to_string();

    let answer = match local_answer(connection.as_ref()) {
        Ok(answer) => answer,
        Err(err) => {
            discard(&connection).await;
            return Err(err);
        }
    };

    let translation = &state.config.translation;
    let target_language =
        Language::parse_or(query.language.as_deref(), translation.default_target_language);
    let source_language = Language::parse_or(
        query.source_language.as_deref(),
        translation.default_source_language,
    );

    let worker = WorkerHandle::spawn(
        state.registry.runtime(),
        Arc::clone(&state.pipeline),
        WorkerConfig {
            session_id: pc_id.clone(),
            source_language,
            target_language,
            translation: translation.clone(),
        },
    );

    if let Err(err) = state
        .registry
        .register(pc_id.clone(), Arc::clone(&connection), worker)
    {
        discard(&connection).await;
        return Err(err.into());
    }
    state.record_session_created();

    info!(
        pc_id = %pc_id,
        "New connection established ({} <- {})",
        target_language,
        source_language
    );
    Ok(answer)
}

fn local_answer(connection: &dyn PeerConnection) -> AppResult<SdpAnswer> {
    connection.answer().ok_or_else(|| {
        AppError::Internal(format!(
            "connection {} has no local description",
            connection.pc_id()
        ))
    })
}

/// Close a connection that never made it into the registry.
async fn discard(connection: &Arc<dyn PeerConnection>) {
    if let Err(err) = connection.disconnect().await {
        warn!(pc_id = %connection.pc_id(), "Error disconnecting rejected connection: {:#}", err);
    }
}
