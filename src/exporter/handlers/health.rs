use crate::{exporter::GIT_COMMIT_HASH, gauges::Gauges};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{debug, error};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
    errors: u64,
}

async fn ping(pool: &PgPool) -> Result<(), StatusCode> {
    let mut conn = pool.acquire().await.map_err(|e| {
        error!(error = %e, "failed to acquire database connection");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    conn.ping().await.map_err(|e| {
        error!(error = %e, "failed to ping database");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

fn app_headers(health: &Health) -> HeaderMap {
    let short_hash = health.commit.get(..7).unwrap_or_default();
    let value = format!("{}:{}:{short_hash}", health.name, health.version);

    let mut headers = HeaderMap::new();
    match value.parse::<HeaderValue>() {
        Ok(v) => {
            headers.insert("X-App", v);
        }
        Err(e) => debug!(error = %e, "failed to build X-App header"),
    }
    headers
}

/// Liveness of the pool plus the running error count. `OPTIONS` gets the
/// status and headers without a body.
pub async fn health(
    method: Method,
    Extension(pool): Extension<PgPool>,
    Extension(gauges): Extension<Gauges>,
) -> impl IntoResponse {
    let db_result = ping(&pool).await;

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if db_result.is_ok() { "ok" } else { "error" }.to_string(),
        errors: gauges.errors_total(),
    };

    let headers = app_headers(&health);
    let body = if method == Method::GET {
        Json(&health).into_response().into_body()
    } else {
        Body::empty()
    };

    let status = db_result.err().unwrap_or(StatusCode::OK);
    debug!(status = status.as_u16(), "health checked");

    (status, headers, body)
}
