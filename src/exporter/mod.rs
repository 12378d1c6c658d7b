use crate::{
    cli::telemetry::shutdown_tracer,
    collectors::{config::CollectorConfig, registry::CollectorRegistry},
    gauges::{Gauges, GaugesConfig, with_statement_timeout},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    http::{HeaderName, HeaderValue},
    middleware::from_fn,
    routing::get,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{net::IpAddr, str::FromStr, time::Duration};
use tokio::{net::TcpListener, time::timeout};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, warn};
use ulid::Ulid;
use url::Url;

mod handlers;
mod shutdown;
mod trace;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

/// Constant label naming the exported database.
pub const DATABASE_LABEL: &str = "database_name";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect, build every enabled collector and serve `/metrics` and `/health`
/// until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the DSN is invalid, the database is unreachable, or the
/// listener cannot bind.
pub async fn new(
    port: u16,
    listen: Option<String>,
    dsn: SecretString,
    mut config: GaugesConfig,
    collectors: Vec<String>,
) -> Result<()> {
    let options = PgConnectOptions::from_str(dsn.expose_secret()).context("Invalid DSN")?;

    if let Some(database) = database_name(&options) {
        config
            .labels
            .entry(DATABASE_LABEL.to_string())
            .or_insert(database);
    }

    let pool = connect(with_statement_timeout(options, config.timeout)).await?;

    info!(dsn = %redact(dsn.expose_secret()), "Connected to database");

    let gauges = Gauges::new(pool.clone(), config)?;

    let registry = CollectorRegistry::new(&CollectorConfig::new().with_enabled(&collectors));
    let registered = registry.register_all(&gauges).await;

    if registered < registry.collector_names().len() {
        warn!(
            registered,
            enabled = registry.collector_names().len(),
            "some collectors failed to register"
        );
    }

    let app = router(pool, gauges);

    let (listener, bind_addr) = bind(listen.as_deref(), port).await?;

    println!(
        "{} {} - Listening on {bind_addr}\n\nEnabled collectors:\n{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        format_list(&registry.collector_names()),
    );

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    info!("shutting down");

    shutdown_tracer();

    Ok(())
}

async fn connect(options: PgConnectOptions) -> Result<PgPool> {
    match timeout(
        CONNECT_TIMEOUT,
        PgPoolOptions::new()
            .min_connections(1)
            .max_connections(3)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect_with(options),
    )
    .await
    {
        Ok(Ok(pool)) => Ok(pool),
        Ok(Err(err)) => Err(err).context("Failed to connect to database"),
        Err(_) => Err(anyhow!(
            "Failed to connect to database: timed out after {}s",
            CONNECT_TIMEOUT.as_secs()
        )),
    }
}

/// Routes plus the request-id and tracing middleware.
pub fn router(pool: PgPool, gauges: Gauges) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(trace::make_span)
        .on_response(trace::on_response);

    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(from_fn(trace::add_trace_headers))
                .layer(Extension(pool))
                .layer(Extension(gauges)),
        )
}

// An explicit address must parse as an IP; otherwise try [::] then 0.0.0.0.
async fn bind(listen: Option<&str>, port: u16) -> Result<(TcpListener, String)> {
    if let Some(addr) = listen {
        let ip: IpAddr = addr.parse().map_err(|_| {
            anyhow!(
                "Invalid IP address: '{addr}'. Expected IPv4 (e.g., 0.0.0.0, 127.0.0.1) or IPv6 (e.g., ::, ::1)"
            )
        })?;

        let display = if ip.is_ipv6() {
            format!("[{ip}]:{port}")
        } else {
            format!("{ip}:{port}")
        };

        let listener = TcpListener::bind((ip, port))
            .await
            .with_context(|| format!("Failed to bind to {display}"))?;

        return Ok((listener, display));
    }

    match TcpListener::bind(format!("[::]:{port}")).await {
        Ok(listener) => Ok((listener, format!("[::]:{port}"))),
        Err(_) => {
            let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("Failed to bind to 0.0.0.0:{port}"))?;
            Ok((listener, format!("0.0.0.0:{port}")))
        }
    }
}

fn database_name(options: &PgConnectOptions) -> Option<String> {
    options
        .get_database()
        .or_else(|| Some(options.get_username()))
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
}

// DSN without its password, for logs.
fn redact(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable dsn>".to_string(),
    }
}

// Helper to format a list of items with a leading dash and indentation for the
// start up message
fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}
