//! Request admission middleware.

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    auth::context::ClientAddr,
    db::pools::Connector,
    errors::Error,
    limits::{LIMIT_HEADER, REMAINING_HEADER},
    types::EndpointClass,
};

/// Charge every request against its client's budget for the path's endpoint class.
///
/// Admitted responses carry `X-RateLimit-Limit`/`X-RateLimit-Remaining`; rejected ones get a
/// 429 with `Retry-After` before any handler runs.
pub async fn rate_limit<C: Connector>(
    State(state): State<AppState<C>>,
    client: ClientAddr,
    request: Request,
    next: Next,
) -> Response {
    let class = EndpointClass::classify(request.uri().path());

    match state.gateway.admit(client.as_str(), class).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            decision.apply_headers(response.headers_mut());
            response
        }
        Err(e) => {
            let rate_limited = matches!(e, Error::RateLimited { .. });
            let mut response = e.into_response();
            if rate_limited {
                let rate_limits = &state.config.rate_limits;
                let limit = rate_limits.limit_for(class).ceiling(rate_limits.window);
                let headers = response.headers_mut();
                headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
                headers.insert(REMAINING_HEADER, HeaderValue::from(0u64));
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ClassLimit;
    use crate::test_utils::{create_test_app, create_test_config};
    use crate::types::EndpointClass;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_headers_on_admitted_requests() {
        let (server, _state) = create_test_app(create_test_config());
        let response = server.get("/auth/config").await;
        response.assert_status(StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "120");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "119");
    }

    #[tokio::test]
    async fn test_rejection_before_handler() {
        let mut config = create_test_config();
        config
            .rate_limits
            .classes
            .insert(EndpointClass::General, ClassLimit::new(2, 0));
        let (server, _state) = create_test_app(config);

        for _ in 0..2 {
            server.get("/auth/config").await.assert_status(StatusCode::OK);
        }
        let response = server.get("/auth/config").await;
        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert!(response.headers().get("retry-after").is_some());

        // Health checks are exempt
        server.get("/healthz").await.assert_status(StatusCode::OK);
    }
}
