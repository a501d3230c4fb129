//! HTTP handlers for configuration retrieval endpoints.

use axum::{Json, extract::State};

use crate::{AppState, config::PublicConfig, db::pools::Connector};

#[utoipa::path(
    get,
    path = "/auth/config",
    tag = "config",
    summary = "Get config",
    description = "Token lifetimes, lockout policy, password policy and rate limits. Contains no secrets.",
    responses(
        (status = 200, description = "Public configuration", body = PublicConfig),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_config<C: Connector>(State(state): State<AppState<C>>) -> Json<PublicConfig> {
    Json(state.config.public())
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{create_test_app, create_test_config};
    use axum::http::StatusCode;
    use serde_json::Value;

    #[tokio::test]
    async fn test_get_config_returns_public_values() {
        let (server, _state) = create_test_app(create_test_config());

        let response = server.get("/auth/config").await;
        response.assert_status(StatusCode::OK);

        let json: Value = response.json();
        assert_eq!(json["lockout_threshold"], 5);
        assert_eq!(json["registration_enabled"], true);
        assert_eq!(json["rate_limits"]["authentication"]["requests_per_minute"], 20);
        assert!(json.get("secret_key").is_none());
        assert!(!response.text().contains("test-secret"));
    }
}
