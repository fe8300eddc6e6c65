use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};

pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the WAL once `threshold` appends have accumulated since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return Ok(false);
    }
    info!("compacting WAL after {appends} appends");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task; runs for the life of the process.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("appointd_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_appends(name: &str, appends: usize) -> (Engine, PathBuf) {
        let path = test_wal_path(name);
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let fid = Ulid::new();
        engine
            .create_facility(fid, None, 30, true, OperatingHours::default())
            .await
            .unwrap();
        for i in 1..appends {
            engine
                .set_operating_hours(fid, (i % 7) as u8, Some(DayHours::new(480, 960)))
                .await
                .unwrap();
        }
        (engine, path)
    }

    #[tokio::test]
    async fn below_threshold_is_left_alone() {
        let (engine, _) = engine_with_appends("below.wal", 3).await;
        assert!(!compact_if_due(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 3);
    }

    #[tokio::test]
    async fn zero_threshold_disables_compaction() {
        let (engine, _) = engine_with_appends("disabled.wal", 5).await;
        assert!(!compact_if_due(&engine, 0).await.unwrap());
    }

    #[tokio::test]
    async fn at_threshold_rewrites_log() {
        let (engine, path) = engine_with_appends("at_threshold.wal", 12).await;
        let before = std::fs::metadata(&path).unwrap().len();
        assert!(compact_if_due(&engine, 12).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
    }
}
