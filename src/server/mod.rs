//! HTTP surface.
//!
//! Thin axum layer over the turn engine: routing, payload validation,
//! the canonical error envelope, an optional shared-key gate on write
//! routes, and the per-session SSE stream. Read routes are always open.

pub mod error;
pub mod handlers;
pub mod sse;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Settings;
use crate::core::events::UpdateBus;
use crate::core::llm::LlmClient;
use crate::core::roll::RollService;
use crate::core::turn::TurnEngine;
use crate::storage::SharedStorage;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub storage: SharedStorage,
    pub bus: UpdateBus,
    pub engine: TurnEngine,
    pub rolls: RollService,
    pub llm: LlmClient,
}

impl AppState {
    pub fn new(settings: Settings, storage: SharedStorage) -> Self {
        let bus = UpdateBus::new();
        let engine = TurnEngine::new(storage.clone(), bus.clone(), settings.clone());
        let rolls = RollService::new(storage.clone(), bus.clone());
        let llm = LlmClient::new(settings.llm.clone());
        Self {
            settings,
            storage,
            bus,
            engine,
            rolls,
            llm,
        }
    }
}

/// Reject writes without the shared secret when one is configured.
/// Read routes stay open.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.settings.api_key else {
        return next.run(request).await;
    };
    let is_write = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    );
    if !is_write {
        return next.run(request).await;
    }
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "kind": "Unauthorized",
                    "message": "missing or invalid x-api-key header",
                }
            })),
        )
            .into_response()
    }
}

/// Build the full service router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/sessions/{slug}/state", get(handlers::session_state))
        .route(
            "/sessions/{slug}/transcript",
            get(handlers::session_transcript),
        )
        .route(
            "/sessions/{slug}/changelog",
            get(handlers::session_changelog),
        )
        .route("/sessions/{slug}/turn", get(handlers::session_turn))
        .route("/sessions/{slug}/diff", get(handlers::session_diff))
        .route("/sessions/{slug}/lock/claim", post(handlers::claim_lock))
        .route(
            "/sessions/{slug}/lock",
            get(handlers::get_lock).delete(handlers::release_lock),
        )
        .route("/sessions/{slug}/turn/preview", post(handlers::turn_preview))
        .route(
            "/sessions/{slug}/turn/preview/{preview_id}",
            delete(handlers::turn_cancel_preview),
        )
        .route("/sessions/{slug}/turn/commit", post(handlers::turn_commit))
        .route(
            "/sessions/{slug}/turn/commit-and-narrate",
            post(handlers::turn_commit_and_narrate),
        )
        .route("/sessions/{slug}/roll", post(handlers::roll))
        .route("/sessions/{slug}/turns", get(handlers::turn_records))
        .route("/sessions/{slug}/turns/{turn}", get(handlers::turn_record))
        .route(
            "/sessions/{slug}/saves",
            get(handlers::list_saves).post(handlers::create_save),
        )
        .route("/sessions/{slug}/saves/{save_id}", get(handlers::get_save))
        .route(
            "/sessions/{slug}/saves/{save_id}/restore",
            post(handlers::restore_save),
        )
        .route(
            "/sessions/{slug}/character",
            get(handlers::get_character).put(handlers::put_character),
        )
        .route(
            "/sessions/{slug}/docs/{kind}",
            get(handlers::get_doc).put(handlers::put_doc),
        )
        .route("/entropy", get(handlers::entropy_preview))
        .route("/events/{slug}", get(sse::events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
