use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};

use crate::app::AppState;
use crate::services::auth_service::authenticate;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // Header, cookie, then ?token= as a last resort
    let query_token = req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });

    let prpls = match authenticate(&state.config, req.headers(), query_token.as_deref()) {
        Ok(prpls) => prpls,
        Err(e) => {
            error!("Authentication failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    debug!("Request authenticated as {:?}", prpls);

    // Principals for downstream handlers
    req.extensions_mut().insert(prpls);

    Ok(next.run(req).await)
}
