use super::common;
use anyhow::Result;
use pg_gauges::gauges::{CellSource, LabeledQuery, Requirement};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_scalar_query_timeout_returns_prior_state() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let slow = gauges.new_scalar(
        "pg_gauges_test_slow",
        "slow scalar",
        "SELECT 1 FROM pg_sleep(2)",
        &[],
    )?;

    let started = Instant::now();
    let value = slow.read().await;

    assert!(started.elapsed() < Duration::from_millis(1900));
    assert!(value.abs() < f64::EPSILON);
    assert_eq!(gauges.errors_total(), 1);

    // the pool is still usable afterwards
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    assert_eq!(row.0, 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_scalar_keeps_last_value_on_failure() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let table = format!("pg_gauges_knob_{}", ulid::Ulid::new().to_string().to_lowercase());
    sqlx::query(&format!("CREATE TABLE {table} (value float8)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} VALUES (42)"))
        .execute(&pool)
        .await?;

    let knob = gauges.new_scalar(
        "pg_gauges_test_knob",
        "knob",
        &format!("SELECT value FROM {table}"),
        &[],
    )?;

    assert!((knob.read().await - 42.0).abs() < f64::EPSILON);

    sqlx::query(&format!("DROP TABLE {table}")).execute(&pool).await?;

    assert!((knob.read().await - 42.0).abs() < f64::EPSILON);
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_vector_query_timeout_keeps_cells() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;
    let vector = gauges.new_vector("pg_gauges_test_timeout", "timeout", &["table"])?;

    let fast: Vec<Box<dyn CellSource>> = vec![Box::new(LabeledQuery::new(
        "fast",
        "SELECT 'orders'::text AS \"table\", 1.0::float8 AS value",
    ))];
    gauges.refresh_once(&vector, &fast).await;
    assert_eq!(vector.get(&["orders"]), Some(1.0));

    let slow: Vec<Box<dyn CellSource>> = vec![Box::new(LabeledQuery::new(
        "slow",
        "SELECT 'orders'::text AS \"table\", 2.0::float8 AS value FROM pg_sleep(2)",
    ))];
    let started = Instant::now();
    gauges.refresh_once(&vector, &slow).await;

    assert!(started.elapsed() < Duration::from_millis(1900));
    assert_eq!(vector.get(&["orders"]), Some(1.0));
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_vector_shape_mismatch_is_an_error() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;
    let vector = gauges.new_vector("pg_gauges_test_shape", "shape", &["table"])?;

    let sources: Vec<Box<dyn CellSource>> = vec![Box::new(LabeledQuery::new(
        "wrong columns",
        "SELECT 'orders'::text AS relname, 1.0::float8 AS value",
    ))];
    gauges.refresh_once(&vector, &sources).await;

    assert!(vector.is_empty());
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_labeled_query_params_are_bound() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;
    let vector = gauges.new_vector("pg_gauges_test_params", "params", &["setting"])?;

    let sources: Vec<Box<dyn CellSource>> = vec![Box::new(
        LabeledQuery::new(
            "settings",
            "SELECT name AS setting, setting::float8 AS value FROM pg_settings WHERE name = $1",
        )
        .with_params(&["max_connections"]),
    )];
    gauges.refresh_once(&vector, &sources).await;

    assert!(vector.get(&["max_connections"]).is_some_and(|v| v > 0.0));
    assert_eq!(gauges.errors_total(), 0);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_reads_without_refresh_are_identical() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;
    let vector = gauges.new_vector("pg_gauges_test_reads", "reads", &["datname"])?;

    let sources: Vec<Box<dyn CellSource>> = vec![Box::new(LabeledQuery::new(
        "databases",
        "SELECT datname::text AS datname, numbackends::float8 AS value FROM pg_stat_database WHERE datname IS NOT NULL",
    ))];
    gauges.refresh_once(&vector, &sources).await;

    assert!(!vector.is_empty());
    assert_eq!(vector.cells(), vector.cells());

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_capabilities_as_superuser() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    assert!(gauges.is_superuser().await);
    assert!(!gauges.server_version().await.is_empty());
    assert!(!gauges.has_extension("pg_gauges_missing_extension").await);
    assert!(gauges.has_extension("plpgsql").await);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_extension_disables_once() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let requirement = Requirement::Extension("pg_gauges_missing_extension");
    assert!(!gauges.require("pg_gauges_test_ext", requirement).await);
    assert_eq!(gauges.errors_total(), 1);

    gauges.gather().await;
    gauges.gather().await;
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_reader_role_is_not_superuser() -> Result<()> {
    let pool = common::create_reader_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    assert!(!gauges.is_superuser().await);
    assert!(!gauges.require("pg_gauges_test_su", Requirement::Superuser).await);
    assert_eq!(gauges.errors_total(), 1);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_timed_out_queries_release_the_pool() -> Result<()> {
    let admin = common::create_test_pool().await?;
    let pool = common::create_bounded_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let marker = format!("gauges_{}", ulid::Ulid::new().to_string().to_lowercase());
    let slow = gauges.new_scalar(
        "pg_gauges_test_slow",
        "slow scalar",
        &format!("SELECT 1 FROM pg_sleep(5) /* {marker} */"),
        &[],
    )?;
    let fast = gauges.new_scalar("pg_gauges_test_fast", "fast scalar", "SELECT 7", &[])?;

    // one slow read per pooled connection
    let values = futures::future::join_all([slow.read(), slow.read(), slow.read()]).await;
    assert!(values.iter().all(|v| v.abs() < f64::EPSILON));
    assert_eq!(gauges.errors_total(), 3);

    let started = Instant::now();
    let value = fast.read().await;
    assert!((value - 7.0).abs() < f64::EPSILON);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(gauges.errors_total(), 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let running: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_stat_activity WHERE state = 'active' AND query LIKE $1 AND pid <> pg_backend_pid()",
    )
    .bind(format!("%{marker}%"))
    .fetch_one(&admin)
    .await?;
    assert_eq!(running, 0);

    pool.close().await;
    admin.close().await;
    Ok(())
}
