use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{Pipeline, RunReport};

/// パイプライン実行の入口。同時に走る実行は 1 つまでに制限する。
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    gate: Arc<Mutex<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// 実行中のものがあれば終わるまで待ってから 1 回実行する。
    pub async fn run_exclusive(&self) -> RunReport {
        let _guard = self.gate.lock().await;
        self.pipeline.run_pipeline().await
    }

    /// 実行中でなければバックグラウンドで実行を開始し、採番した ID を返す。
    #[must_use]
    pub fn try_spawn(&self) -> Option<(Uuid, JoinHandle<RunReport>)> {
        let Ok(guard) = Arc::clone(&self.gate).try_lock_owned() else {
            warn!("pipeline run already in progress; manual trigger ignored");
            return None;
        };
        let run_id = Uuid::now_v7();
        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let report = pipeline.run_with_id(run_id).await;
            info!(
                %run_id,
                persisted = report.total_persisted(),
                "manual pipeline run completed"
            );
            report
        });
        Some((run_id, handle))
    }
}

#[cfg(test)]
pub(crate) fn scheduler_for(
    store: &crate::store::memory::MemoryStore,
) -> (Scheduler, crate::observability::Telemetry) {
    use std::num::NonZeroUsize;

    use crate::classifier::Verdict;
    use crate::observability::Telemetry;
    use crate::pipeline::mock::ScriptedClassifier;
    use crate::store::ToxicityLabel;
    use crate::store::tables::{REDDIT_COMMENTS, REDDIT_POSTS};

    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let pipeline = Pipeline::new(
        Arc::new(store.clone()),
        Arc::new(ScriptedClassifier::new(Verdict::Label(ToxicityLabel::NotToxic))),
        vec![&REDDIT_POSTS, &REDDIT_COMMENTS],
        NonZeroUsize::new(4).expect("non-zero"),
        NonZeroUsize::new(2).expect("non-zero"),
        telemetry.metrics_arc(),
    );
    (Scheduler::new(Arc::new(pipeline)), telemetry)
}
