use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, SweepReport};
use crate::observability::SWEEP_DURATION_SECONDS;

/// Facility wall clock. Reservations are stored in local time.
pub fn facility_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Run one auto-expire pass on the blocking pool.
pub async fn sweep_once(engine: Arc<Engine>, now: NaiveDateTime) -> SweepReport {
    let started = Instant::now();
    let report = match tokio::task::spawn_blocking(move || engine.auto_expire(now)).await {
        Ok(report) => report,
        Err(e) => {
            error!("sweep task failed: {e}");
            SweepReport::default()
        }
    };
    metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    report
}

/// Background task that periodically ends reservations left running past
/// their reserved end.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let report = sweep_once(engine.clone(), facility_now()).await;
        for completion in &report.expired {
            info!("auto-expired reservation {}", completion.reservation.id);
        }
        for (id, e) in &report.failures {
            // Left for the next pass.
            warn!("sweep skip {id}: {e}");
        }
    }
}

/// Background task that rewrites the WAL once enough events piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact();
        if appends < threshold {
            continue;
        }
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.compact_wal()).await {
            Ok(Ok(())) => debug!("compacted WAL after {appends} appends"),
            Ok(Err(e)) => warn!("WAL compaction failed: {e}"),
            Err(e) => error!("compaction task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::ScheduleConfig;
    use crate::engine::BookingRequest;
    use crate::model::fixtures::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::reservation::ReservationState;
    use crate::rules::{AvailabilityRule, DaySet};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("labsched_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Arc<Engine> {
        Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                ScheduleConfig::default(),
                Collaborators::detached(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn sweep_ends_overdue_reservation() {
        let engine = engine("sweep_overdue.wal");
        let rid = Ulid::new();
        engine.create_resource(rid, None, ResourcePolicy::default()).unwrap();
        engine
            .add_rule(AvailabilityRule::new(rid, DaySet::every_day(), (8, 0), (18, 0)))
            .unwrap();
        let r = engine
            .book(
                BookingRequest {
                    resource_id: rid,
                    window: Span::new(mon(9, 0), mon(10, 0)),
                    order_ref: Some(Ulid::new()),
                },
                mon(8, 0),
            )
            .unwrap();
        engine.start(r.id, mon(9, 0)).unwrap();

        let report = sweep_once(engine.clone(), mon(10, 30)).await;
        assert_eq!(report.expired.len(), 1);
        let after = engine.reservation(&r.id).unwrap();
        assert_eq!(after.state(), ReservationState::Ended);
        assert_eq!(after.actual_end_at, Some(mon(10, 0)));

        let again = sweep_once(engine.clone(), mon(10, 35)).await;
        assert!(again.expired.is_empty());
        assert!(again.failures.is_empty());
    }

    #[tokio::test]
    async fn compactor_resets_append_count() {
        let engine = engine("compactor.wal");
        for _ in 0..3 {
            engine
                .create_resource(Ulid::new(), None, ResourcePolicy::default())
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact(), 3);

        let task = tokio::spawn(run_compactor(engine.clone(), 2, Duration::from_millis(10)));
        for _ in 0..100 {
            if engine.wal_appends_since_compact() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(engine.wal_appends_since_compact(), 0);
        assert_eq!(engine.list_resources().len(), 3);
    }
}
