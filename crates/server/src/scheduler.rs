//! Timer-driven retention.
//!
//! Two loops: a fast one for upload, merge and orphan housekeeping on
//! `interval_secs`, and a slow one for stale-entry pruning on
//! `stale_interval_secs`. Jobs operate on disjoint or idempotent conditions,
//! so they may overlap each other and live traffic.

use crate::engine::CacheEngine;
use crate::error::EngineResult;
use crate::retention::RetentionStats;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Handles of the spawned retention loops.
pub struct RetentionTasks {
    pub housekeeping: JoinHandle<()>,
    pub stale: Option<JoinHandle<()>>,
}

impl RetentionTasks {
    pub fn abort(&self) {
        self.housekeeping.abort();
        if let Some(stale) = &self.stale {
            stale.abort();
        }
    }
}

/// Spawn the retention loops. Returns `None` when retention is disabled.
pub fn spawn_retention(engine: CacheEngine) -> Option<RetentionTasks> {
    let config = engine.retention_config().clone();
    if !config.enabled {
        tracing::info!("Retention disabled");
        return None;
    }

    tracing::info!(
        interval_secs = config.interval_secs,
        stale_interval_secs = config.stale_interval_secs,
        max_unused_days = ?config.max_unused_days,
        "Retention scheduler enabled"
    );

    let housekeeping = {
        let engine = engine.clone();
        spawn_ticker(config.interval(), move || {
            let engine = engine.clone();
            async move { run_housekeeping(&engine, OffsetDateTime::now_utc()).await }
        })
    };

    let stale = config.max_unused_days.map(|days| {
        spawn_ticker(config.stale_interval(), move || {
            let engine = engine.clone();
            async move {
                log_failure(
                    "prune_stale",
                    engine.prune_stale(Some(days), OffsetDateTime::now_utc()).await,
                );
            }
        })
    });
    if stale.is_none() {
        tracing::info!("No max_unused_days configured, stale pruning disabled");
    }

    Some(RetentionTasks {
        housekeeping,
        stale,
    })
}

/// One pass of the fast jobs.
pub async fn run_housekeeping(engine: &CacheEngine, now: OffsetDateTime) {
    log_failure("reset_stalled_merges", engine.reset_stalled_merges(now).await);
    log_failure("prune_dangling_uploads", engine.prune_dangling_uploads(now).await);
    log_failure("reclaim_merged_parts", engine.reclaim_merged_parts(now).await);
    log_failure("prune_orphans", engine.prune_orphans().await);
}

fn log_failure(job: &'static str, result: EngineResult<RetentionStats>) {
    if let Err(e) = result {
        tracing::error!(job, error = %e, "Retention job failed");
    }
}

fn spawn_ticker<F, Fut>(period: Duration, mut run: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run().await;
        }
    })
}
