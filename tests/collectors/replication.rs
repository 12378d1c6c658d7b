use super::common;
use anyhow::Result;
use pg_gauges::collectors::replication::{replication_lag, replication_lag_source};
use pg_gauges::gauges::CellSource;

#[tokio::test]
async fn test_replication_lag_query_runs() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let gauges = common::create_gauges(pool.clone())?;

    let vector = replication_lag(&gauges).await?;
    let version = gauges.server_version().await;
    let sources: Vec<Box<dyn CellSource>> = vec![Box::new(replication_lag_source(&version))];
    gauges.refresh_once(&vector, &sources).await;

    // a standalone server has no standbys
    assert!(vector.cells().values().all(|v| v.is_finite()));
    assert_eq!(gauges.errors_total(), 0);

    pool.close().await;
    Ok(())
}
