//! OpenAPI documentation for the HTTP API, served with Scalar at `/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api;

/// Security scheme for access tokens.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "BearerAuth".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Access token returned by `/auth/login` or `/auth/refresh`:\n\n\
                            ```\nAuthorization: Bearer ACCESS_TOKEN\n```\n\n\
                            Access tokens are short-lived; exchange the refresh token for a new pair when one expires.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::refresh,
        api::handlers::auth::logout,
        api::handlers::config::get_config,
        api::handlers::users::get_me,
        api::handlers::users::list_sessions,
        api::handlers::users::disable_user,
        api::handlers::users::enable_user,
        api::handlers::system::healthz,
        api::handlers::system::pool_status,
        api::handlers::system::lockout_status,
        api::handlers::system::unlock,
    ),
    components(
        schemas(
            api::models::auth::RegisterRequest,
            api::models::auth::LoginRequest,
            api::models::auth::LoginResponse,
            api::models::auth::RefreshRequest,
            api::models::auth::LogoutRequest,
            api::models::auth::LogoutResponse,
            api::models::users::UserResponse,
            api::models::users::CurrentUserResponse,
            api::models::users::SessionResponse,
            api::models::system::HealthResponse,
            api::models::system::PoolStatusResponse,
            api::models::system::LockoutResponse,
            api::models::system::DisableUserResponse,
            crate::auth::tokens::TokenPair,
            crate::auth::lockout::LockoutStatus,
            crate::config::PublicConfig,
            crate::config::PublicClassLimit,
            crate::db::pools::PoolMetricsSnapshot,
            crate::errors::ErrorBody,
            crate::types::Role,
            crate::types::EndpointClass,
        )
    ),
    tags(
        (name = "authentication", description = "Registration, login, token refresh and logout"),
        (name = "users", description = "The authenticated caller"),
        (name = "config", description = "Public configuration"),
        (name = "admin", description = "Administrative operations (administrator role required)"),
        (name = "system", description = "Health"),
    ),
    info(
        title = "Gatehouse API",
        description = "Authentication, brute-force protection, rate limiting and connection governance",
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_documents_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/auth/register",
            "/auth/login",
            "/auth/refresh",
            "/auth/logout",
            "/auth/config",
            "/auth/me",
            "/auth/sessions",
            "/healthz",
            "/admin/pool",
            "/admin/lockout",
            "/admin/users/{user_id}/disable",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        assert!(
            doc.components
                .as_ref()
                .is_some_and(|c| c.security_schemes.contains_key("BearerAuth"))
        );
    }
}
