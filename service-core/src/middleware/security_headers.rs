use axum::{extract::Request, http::header, middleware::Next, response::IntoResponse};

/// Paths that serve browser-rendered documentation rather than JSON.
fn is_docs_route(path: &str) -> bool {
    path.starts_with("/docs") || path == "/.well-known/openapi.json"
}

pub async fn security_headers_middleware(req: Request, next: Next) -> impl IntoResponse {
    let docs = is_docs_route(req.uri().path());
    let api = req.uri().path().starts_with("/api/");

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        header::HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    if docs {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            header::HeaderValue::from_static(
                "default-src 'self'; \
                 script-src 'self' 'unsafe-inline'; \
                 style-src 'self' 'unsafe-inline'; \
                 img-src 'self' data:; \
                 font-src 'self'; \
                 connect-src 'self'",
            ),
        );
        headers.insert(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("SAMEORIGIN"),
        );
    } else {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            header::HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        );
        headers.insert(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        );
    }

    // Bearer-bearing responses (login, access keys) must never be cached.
    if api && !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as HttpRequest, middleware::from_fn, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn api_responses_are_not_cached() {
        let app = Router::new()
            .route("/api/version", get(|| async { "ok" }))
            .layer(from_fn(security_headers_middleware));

        let res = app
            .oneshot(HttpRequest::get("/api/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(res.headers()[header::X_FRAME_OPTIONS], "DENY");
    }

    #[test]
    fn docs_detection() {
        assert!(is_docs_route("/docs/index.html"));
        assert!(is_docs_route("/.well-known/openapi.json"));
        assert!(!is_docs_route("/api/openapi.json"));
        assert!(!is_docs_route("/api/users"));
    }

    #[tokio::test]
    async fn the_openapi_document_may_be_framed_by_the_docs_ui() {
        let app = Router::new()
            .route("/.well-known/openapi.json", get(|| async { "{}" }))
            .layer(from_fn(security_headers_middleware));

        let res = app
            .oneshot(
                HttpRequest::get("/.well-known/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.headers()[header::X_FRAME_OPTIONS], "SAMEORIGIN");
        assert!(!res.headers().contains_key(header::CACHE_CONTROL));
    }
}
