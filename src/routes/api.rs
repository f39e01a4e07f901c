use crate::{app::AppState, handlers::{diagnostics, health_check, ready_check, room_end}, routes::auth_middleware::auth_middleware};
use axum::{middleware, routing::{get, post}, Router};

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router<AppState> {
    let protected = Router::<AppState>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/rooms/:room_id/end", post(room_end))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware)); // Applies to all routes added above

    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(protected)
}
