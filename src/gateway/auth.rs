use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::IntoResponse,
    Json,
};

use super::AppState;

/// Extract the caller's token from `Authorization: Bearer` or `?token=`.
fn provided_token(req: &Request<Body>) -> Option<String> {
    let header_token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());

    // Browsers can't set headers on a websocket upgrade.
    let query_token = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|s| s.to_string())
    });

    header_token.or(query_token)
}

pub(crate) async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    let Some(ref expected) = state.api_token else {
        return next.run(req).await;
    };

    match provided_token(&req) {
        Some(ref token) if token == expected => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid token"})),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing or invalid Authorization header"})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(a) = auth {
            builder = builder.header(axum::http::header::AUTHORIZATION, a);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn header_token_takes_precedence() {
        let req = request("/api/status?token=q", Some("Bearer h"));
        assert_eq!(provided_token(&req).as_deref(), Some("h"));
    }

    #[test]
    fn query_token_is_accepted() {
        let req = request("/ws?x=1&token=abc", None);
        assert_eq!(provided_token(&req).as_deref(), Some("abc"));
    }

    #[test]
    fn non_bearer_header_is_ignored() {
        let req = request("/api/status", Some("Basic Zm9v"));
        assert_eq!(provided_token(&req), None);
    }
}
