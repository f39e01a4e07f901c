use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use tracing::{debug, error, warn};

use crate::auth::auth::OPEN_ACCESS_PRPL;
use crate::config::Config;

// Get the auth token from the request headers, falling back to a query token
pub fn get_auth_token(headers: &HeaderMap, query_token: Option<&str>) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| "Invalid Authorization header".to_string())?;
        return Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string());
    }

    // 2. Try to get token from cookies
    if let Some(cookie_header) = headers.get(http::header::COOKIE) {
        let cookie_str = cookie_header
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;
        for cookie in cookie::Cookie::split_parse(cookie_str).flatten() {
            if cookie.name() == "auth_token" {
                return Ok(cookie.value().to_string());
            }
        }
    }

    // 3. Browsers cannot set headers on websocket upgrades
    match query_token {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err("Missing Authorization header, auth_token cookie or token parameter".to_string()),
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Principals carried by validated claims: `u/<uid>` plus `r/<role>` for
/// user tokens, `s/<service>` for service tokens
pub fn principals_from_claims(claims: &serde_json::Value) -> Result<Vec<String>, String> {
    let subject = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "JWT token does not contain 'sub' claim".to_string())?;
    let token_type = claims.get("type").and_then(|v| v.as_str()).unwrap_or("user");

    match token_type {
        "user" => {
            let mut prpls = vec![format!("u/{}", subject)];
            if let Some(roles) = claims.get("roles").and_then(|v| v.as_array()) {
                prpls.extend(roles.iter().filter_map(|r| r.as_str()).map(|r| format!("r/{}", r)));
            }
            Ok(prpls)
        }
        "service" => Ok(vec![format!("s/{}", subject)]),
        other => Err(format!("Invalid token type: {}", other)),
    }
}

/// Authenticate a request. Without a configured secret every caller is admitted.
pub fn authenticate(config: &Config, headers: &HeaderMap, query_token: Option<&str>) -> Result<Vec<String>, String> {
    let secret = match &config.cloud_auth_jwt_secret {
        Some(secret) => secret,
        None => {
            warn!("No JWT secret configured, admitting unauthenticated request");
            return Ok(vec![OPEN_ACCESS_PRPL.to_string()]);
        }
    };

    let token = get_auth_token(headers, query_token)?;
    let token_data = validate_jwt(&token, secret).map_err(|e| {
        error!("JWT validation failed: {}", e);
        format!("JWT validation failed: {}", e)
    })?;
    let prpls = principals_from_claims(&token_data.claims)?;
    debug!("Authenticated principals {:?}", prpls);
    Ok(prpls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(claims: serde_json::Value, secret: &str) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn config(secret: Option<&str>) -> Config {
        Config {
            cloud_auth_jwt_secret: secret.map(str::to_string),
            ..Config::default()
        }
    }

    #[test]
    fn token_lookup_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("theme=dark; auth_token=from-cookie"));
        assert_eq!(get_auth_token(&headers, Some("from-query")).unwrap(), "from-cookie");

        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(get_auth_token(&headers, Some("from-query")).unwrap(), "from-header");

        assert_eq!(get_auth_token(&HeaderMap::new(), Some("from-query")).unwrap(), "from-query");
        assert!(get_auth_token(&HeaderMap::new(), None).is_err());
    }

    #[test]
    fn service_and_user_tokens_map_to_principals() {
        let exp = chrono::Utc::now().timestamp() + 60;
        let cfg = config(Some("secret"));

        let service = token(json!({ "sub": "colabri-app", "type": "service", "exp": exp }), "secret");
        assert_eq!(
            authenticate(&cfg, &HeaderMap::new(), Some(&service)).unwrap(),
            vec!["s/colabri-app".to_string()]
        );

        let user = token(json!({ "sub": "u1", "roles": ["Colabri-CloudAdmin"], "exp": exp }), "secret");
        assert_eq!(
            authenticate(&cfg, &HeaderMap::new(), Some(&user)).unwrap(),
            vec!["u/u1".to_string(), "r/Colabri-CloudAdmin".to_string()]
        );

        let forged = token(json!({ "sub": "u1", "exp": exp }), "other");
        assert!(authenticate(&cfg, &HeaderMap::new(), Some(&forged)).is_err());
    }

    #[test]
    fn open_mode_admits_everyone() {
        let prpls = authenticate(&config(None), &HeaderMap::new(), None).unwrap();
        assert_eq!(prpls, vec![OPEN_ACCESS_PRPL.to_string()]);
    }
}
