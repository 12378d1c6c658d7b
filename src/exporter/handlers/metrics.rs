use crate::gauges::Gauges;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use tracing::{debug, error};

/// Scalars are queried now; labeled gauges return their last refresh.
pub async fn metrics(Extension(gauges): Extension<Gauges>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    match gauges.render().await {
        Ok(body) => {
            debug!(bytes = body.len(), "rendered metrics");
            (StatusCode::OK, headers, body)
        }
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error rendering metrics: {e}"),
            )
        }
    }
}
