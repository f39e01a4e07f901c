use axum::{http::StatusCode, Json};

use crate::models::ErrorResponse;

const CLOUD_ADMIN_PRPL: &str = "r/Colabri-CloudAdmin";

/// Granted to every caller when no JWT secret is configured
pub const OPEN_ACCESS_PRPL: &str = "o/open";

pub fn is_cloud_admin(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == CLOUD_ADMIN_PRPL)
}

pub fn is_open_access(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == OPEN_ACCESS_PRPL)
}

/// User id carried by a `u/<id>` principal
pub fn user_of(prpls: &[String]) -> Option<&str> {
    prpls.iter().find_map(|p| p.strip_prefix("u/"))
}

fn forbidden(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::FORBIDDEN;
    (status, Json(ErrorResponse::new(status, message)))
}

/// Any service token, a cloud admin or an open server
pub fn ensure_service(prpls: &[String]) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if let Some(service) = prpls.iter().find(|p| p.starts_with("s/")) {
        return Ok(service.clone());
    }
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }
    if is_open_access(prpls) {
        return Ok(OPEN_ACCESS_PRPL.to_string());
    }
    Err(forbidden("Service access required"))
}

pub fn ensure_cloud_admin(prpls: &[String]) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }
    if is_open_access(prpls) {
        return Ok(OPEN_ACCESS_PRPL.to_string());
    }
    Err(forbidden("Cloud Admin access required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prpls(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn users_cannot_act_as_services() {
        assert!(ensure_service(&prpls(&["u/u1"])).is_err());
        assert_eq!(ensure_service(&prpls(&["s/colabri-app"])).unwrap(), "s/colabri-app");
        assert!(ensure_service(&prpls(&["u/u1", CLOUD_ADMIN_PRPL])).is_ok());
        assert!(ensure_service(&prpls(&[OPEN_ACCESS_PRPL])).is_ok());
    }

    #[test]
    fn diagnostics_need_cloud_admin() {
        let (status, _) = ensure_cloud_admin(&prpls(&["s/colabri-app"])).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(ensure_cloud_admin(&prpls(&[CLOUD_ADMIN_PRPL])).is_ok());
    }

    #[test]
    fn user_principal_names_the_user() {
        assert_eq!(user_of(&prpls(&["r/editor", "u/u1"])), Some("u1"));
        assert_eq!(user_of(&prpls(&["s/colabri-app"])), None);
    }
}
