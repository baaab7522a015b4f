use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::info;

use super::jobs::Scheduler;

/// 起動直後に 1 回、その後 `period` ごとにパイプラインを実行するデーモンを起動する。
///
/// 前回の実行が周期を超えた場合、溜まったティックは捨てて次の周期を待つ。
pub fn spawn_interval_daemon(scheduler: Scheduler, period: Duration) -> JoinHandle<()> {
    IntervalDaemon { scheduler, period }.spawn()
}

struct IntervalDaemon {
    scheduler: Scheduler,
    period: Duration,
}

impl IntervalDaemon {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.scheduler.run_exclusive().await;
            info!(
                run_id = %report.run_id,
                persisted = report.total_persisted(),
                duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
                next_run_in_secs = self.period.as_secs(),
                "scheduled toxicity run completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::jobs::scheduler_for;
    use crate::store::memory::MemoryStore;
    use crate::store::tables::REDDIT_POSTS;
    use serde_json::json;

    async fn wait_for(store: &MemoryStore, expected: usize) {
        for _ in 0..1_000 {
            if store.processed_count(&REDDIT_POSTS) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {expected} processed rows");
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_each_interval() {
        let store = MemoryStore::new();
        store.insert_raw(&REDDIT_POSTS, json!({ "id": "p1", "body": "first" }));
        let (scheduler, telemetry) = scheduler_for(&store);

        let handle = spawn_interval_daemon(scheduler, Duration::from_secs(60));

        wait_for(&store, 1).await;
        assert!((telemetry.metrics().runs_completed.get() - 1.0).abs() < f64::EPSILON);

        store.insert_raw(&REDDIT_POSTS, json!({ "id": "p2", "body": "second" }));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.processed_count(&REDDIT_POSTS), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&store, 2).await;
        assert!(telemetry.metrics().runs_completed.get() >= 2.0);

        handle.abort();
    }
}
