use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Config, SessionConfig};
use crate::docs::ApiDoc;
use crate::routes::create_api_routes;
use crate::ws::{docs_ws_handler, events_ws_handler, DocRelay, RoomHub};

/// Shared state of the room server
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RoomHub>,
    pub relay: Arc<DocRelay>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, session: &SessionConfig) -> Self {
        Self {
            hub: Arc::new(RoomHub::new(session.typing_timeout(), session.leave_dedupe())),
            relay: Arc::new(DocRelay::new()),
            config: Arc::new(config),
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = config.cors_origin_list();
    if origins.is_empty() {
        if !config.is_development() {
            warn!("No CORS origins configured, allowing any origin");
        }
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
}

/// HTTP API, both websocket endpoints and the Swagger UI
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(state.clone()))
        .route("/ws/events", get(events_ws_handler))
        .route("/ws/docs/:room_id", get(docs_ws_handler))
        .with_state(state)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
}
