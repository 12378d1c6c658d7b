use super::common;
use anyhow::Result;
use pg_gauges::collectors::{
    Collector,
    backends::{
        BackendsCollector, backends, backends_status, max_backends, status_sources,
        waiting_backends,
    },
};
use sqlx::{
    Connection, PgConnection,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;

#[tokio::test]
async fn test_backend_scalars_are_non_negative() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let total = backends(&gauges)?;
    let max = max_backends(&gauges)?;
    let waiting = waiting_backends(&gauges).await?;

    assert!(total.read().await >= 0.0);
    assert!(max.read().await > 0.0);
    assert!(waiting.read().await >= 0.0);
    assert_eq!(gauges.errors_total(), 0);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_backends_status_counts_by_state_and_user() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let vector = gauges.new_vector(
        "pg_gauges_test_backends_status",
        "status",
        &["status", "user"],
    )?;
    let version = gauges.server_version().await;
    gauges.refresh_once(&vector, &status_sources(&version)).await;

    let user: String = sqlx::query_scalar("SELECT current_user::text")
        .fetch_one(&pool)
        .await?;

    let cells = vector.cells();
    assert!(!cells.is_empty());
    assert!(cells.values().all(|v| *v >= 0.0));
    // the refresh query itself runs on an active backend
    assert!(vector.get(&["active", &user]).is_some_and(|v| v >= 1.0));
    assert_eq!(gauges.errors_total(), 0);

    pool.close().await;
    Ok(())
}

async fn open_session(role: &str, database: &str, statements: &[&str]) -> Result<PgConnection> {
    let mut conn = PgConnection::connect(&common::get_role_dsn(role, Some(database))?).await?;
    for statement in statements {
        // a failing statement is how the session gets aborted
        let _ = sqlx::raw_sql(statement).execute(&mut conn).await;
    }
    Ok(conn)
}

#[tokio::test]
async fn test_backends_status_matches_sessions() -> Result<()> {
    let admin = common::create_test_pool().await?;
    let database = format!("gauges_status_{}", ulid::Ulid::new().to_string().to_lowercase());
    sqlx::query(&format!("CREATE DATABASE {database}"))
        .execute(&admin)
        .await?;
    common::ensure_role(&admin, "gauges_idle_a").await?;
    common::ensure_role(&admin, "gauges_idle_b").await?;

    let sessions = vec![
        open_session("gauges_idle_a", &database, &[]).await?,
        open_session("gauges_idle_a", &database, &[]).await?,
        open_session("gauges_idle_a", &database, &["BEGIN"]).await?,
        open_session("gauges_idle_b", &database, &["BEGIN", "SELECT 1/0"]).await?,
    ];

    // a single connection, so the refresh itself is the only superuser session
    let options = PgConnectOptions::from_str(&common::get_test_dsn())?.database(&database);
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    let gauges = common::create_gauges(pool.clone())?;

    let vector = gauges.new_vector(
        "pg_gauges_test_backends_sessions",
        "status",
        &["status", "user"],
    )?;
    let version = gauges.server_version().await;
    gauges.refresh_once(&vector, &status_sources(&version)).await;
    assert_eq!(gauges.errors_total(), 0);

    let superuser: String = sqlx::query_scalar("SELECT current_user::text")
        .fetch_one(&pool)
        .await?;

    let expected = [
        ("idle", "gauges_idle_a", 2.0),
        ("idle in transaction", "gauges_idle_a", 1.0),
        ("idle in transaction (aborted)", "gauges_idle_b", 1.0),
        ("active", superuser.as_str(), 1.0),
    ];
    assert_eq!(vector.len(), expected.len(), "cells: {:?}", vector.cells());
    for (state, user, count) in expected {
        assert_eq!(vector.get(&[state, user]), Some(count), "{state}/{user}");
    }

    let activity: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT state, usename::text, COUNT(*) FROM pg_stat_activity \
         WHERE datname = current_database() AND usename IN ('gauges_idle_a', 'gauges_idle_b') \
         GROUP BY state, usename",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(activity.len(), 3);
    for (state, user, count) in activity {
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        assert_eq!(
            vector.get(&[state.as_str(), user.as_str()]),
            Some(count),
            "{state}/{user}"
        );
    }

    for session in sessions {
        session.close().await?;
    }
    pool.close().await;
    sqlx::query(&format!("DROP DATABASE {database} WITH (FORCE)"))
        .execute(&admin)
        .await?;
    admin.close().await;
    Ok(())
}

#[tokio::test]
async fn test_backends_status_disabled_for_reader() -> Result<()> {
    let pool = common::create_reader_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let vector = backends_status(&gauges).await?;
    assert!(vector.is_empty());
    assert!(!vector.is_started());
    assert_eq!(gauges.errors_total(), 1);

    for _ in 0..3 {
        gauges.gather().await;
    }
    assert!(vector.is_empty());
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_backends_collector_registers_metrics() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    BackendsCollector.register(&gauges).await?;

    let families = gauges.gather().await;
    for name in [
        "postgresql_backends_total",
        "postgresql_max_backends",
        "postgresql_waiting_backends",
    ] {
        assert!(families.iter().any(|f| f.name() == name), "missing {name}");
    }

    pool.close().await;
    Ok(())
}
