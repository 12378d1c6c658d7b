use super::common;
use anyhow::Result;
use pg_gauges::collectors::{
    Collector,
    database::{DatabaseCollector, in_recovery, size},
};

#[tokio::test]
async fn test_database_scalars_are_non_negative() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let size = size(&gauges)?;
    let in_recovery = in_recovery(&gauges)?;

    assert!(size.read().await > 0.0);
    let recovery = in_recovery.read().await;
    assert!(recovery.abs() < f64::EPSILON || (recovery - 1.0).abs() < f64::EPSILON);
    assert_eq!(gauges.errors_total(), 0);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_database_collector_registers_metrics() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    DatabaseCollector.register(&gauges).await?;

    let families = gauges.gather().await;
    for name in ["postgresql_size_bytes", "postgresql_in_recovery"] {
        assert!(
            families.iter().any(|f| f.name() == name),
            "Metric {name} should exist. Found: {:?}",
            families.iter().map(|f| f.name()).collect::<Vec<_>>()
        );
    }

    pool.close().await;
    Ok(())
}
