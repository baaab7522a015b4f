use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::ledger::RunLedger;
use super::worker::{RecordOutcome, RecordWorker};
use crate::classifier::Classifier;
use crate::observability::metrics::Metrics;
use crate::store::{RecordStore, RecordTable};

/// テーブル単位の集計。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: &'static str,
    pub pending: usize,
    /// 変換できずに読み飛ばした行。`pending` には含まれない。
    pub undecodable: usize,
    pub persisted: usize,
    pub indeterminate: usize,
    pub missing_parent: usize,
    pub parent_indeterminate: usize,
    pub write_failed: usize,
    pub already_handled: usize,
    pub fetch_failed: bool,
}

impl TableReport {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Persisted => &mut self.persisted,
            RecordOutcome::Indeterminate => &mut self.indeterminate,
            RecordOutcome::MissingParent => &mut self.missing_parent,
            RecordOutcome::ParentIndeterminate => &mut self.parent_indeterminate,
            RecordOutcome::WriteFailed => &mut self.write_failed,
            RecordOutcome::AlreadyHandled => &mut self.already_handled,
        };
        *counter += 1;
    }

    /// 次回の実行でも保留として残る件数。
    #[must_use]
    pub fn still_pending(&self) -> usize {
        self.indeterminate + self.missing_parent + self.parent_indeterminate + self.write_failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub tables: Vec<TableReport>,
    pub duration: Duration,
}

impl RunReport {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == name)
    }

    #[must_use]
    pub fn total_persisted(&self) -> usize {
        self.tables.iter().map(|report| report.persisted).sum()
    }
}

/// 有効なテーブル群に対してパイプラインを 1 回実行する。
///
/// テーブルごとにスーパーバイザーを立て、同時に動くのは
/// `supervisor_concurrency` 個まで。各スーパーバイザーは
/// `worker_concurrency` 個までのワーカータスクにレコードを割り振る。
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    classifier: Arc<dyn Classifier>,
    tables: Vec<&'static RecordTable>,
    worker_concurrency: NonZeroUsize,
    supervisor_concurrency: NonZeroUsize,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        classifier: Arc<dyn Classifier>,
        tables: Vec<&'static RecordTable>,
        worker_concurrency: NonZeroUsize,
        supervisor_concurrency: NonZeroUsize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            classifier,
            tables,
            worker_concurrency,
            supervisor_concurrency,
            metrics,
        }
    }

    #[must_use]
    pub fn tables(&self) -> &[&'static RecordTable] {
        &self.tables
    }

    /// 失敗はすべてレコード単位またはテーブル単位で集計され、呼び出し側には返らない。
    pub async fn run_pipeline(&self) -> RunReport {
        self.run_with_id(Uuid::now_v7()).await
    }

    /// 呼び出し側が採番した ID で実行する。
    pub async fn run_with_id(&self, run_id: Uuid) -> RunReport {
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        self.metrics.active_runs.inc();
        info!(
            tables = self.tables.len(),
            worker_concurrency = self.worker_concurrency.get(),
            supervisor_concurrency = self.supervisor_concurrency.get(),
            "pipeline run started"
        );

        let worker = Arc::new(RecordWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.classifier),
            RunLedger::new(),
            Arc::clone(&self.metrics),
        ));
        let supervisors = Arc::new(Semaphore::new(self.supervisor_concurrency.get()));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for &table in &self.tables {
            let Ok(permit) = Arc::clone(&supervisors).acquire_owned().await else {
                break;
            };
            let supervisor = Supervisor {
                store: Arc::clone(&self.store),
                worker: Arc::clone(&worker),
                metrics: Arc::clone(&self.metrics),
                worker_concurrency: self.worker_concurrency,
            };
            let handle = tasks.spawn(
                async move {
                    let _permit = permit;
                    supervisor.run(table).await
                }
                .in_current_span(),
            );
            names.insert(handle.id(), table.name);
        }

        let mut reports = Vec::with_capacity(self.tables.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(join_error) => {
                    let table = names.get(&join_error.id()).copied().unwrap_or("unknown");
                    error!(table, error = %join_error, "table supervisor aborted");
                    let mut report = TableReport::new(table);
                    report.fetch_failed = true;
                    reports.push(report);
                }
            }
        }
        reports.sort_by_key(|report| {
            self.tables
                .iter()
                .position(|table| table.name == report.table)
                .unwrap_or(usize::MAX)
        });

        let duration = started.elapsed();
        self.metrics.active_runs.dec();
        self.metrics.runs_completed.inc();
        self.metrics.run_duration.observe(duration.as_secs_f64());

        let report = RunReport {
            run_id,
            started_at,
            tables: reports,
            duration,
        };
        info!(
            persisted = report.total_persisted(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "pipeline run finished"
        );
        report
    }
}

/// テーブル 1 つ分のファンアウト。
struct Supervisor {
    store: Arc<dyn RecordStore>,
    worker: Arc<RecordWorker>,
    metrics: Arc<Metrics>,
    worker_concurrency: NonZeroUsize,
}

impl Supervisor {
    async fn run(self, table: &'static RecordTable) -> TableReport {
        let mut report = TableReport::new(table.name);

        let pending = match self.store.fetch_pending(table).await {
            Ok(pending) => pending,
            Err(error) => {
                error!(table = table.name, error = %format!("{error:#}"), "failed to fetch pending records");
                self.metrics
                    .fetch_failures
                    .with_label_values(&[table.name])
                    .inc();
                report.fetch_failed = true;
                return report;
            }
        };
        report.pending = pending.len();
        report.undecodable = pending.undecodable;
        #[allow(clippy::cast_precision_loss)]
        let (fetched, skipped) = (pending.len() as f64, pending.undecodable as f64);
        self.metrics
            .records_fetched
            .with_label_values(&[table.name])
            .inc_by(fetched);
        self.metrics
            .records_undecodable
            .with_label_values(&[table.name])
            .inc_by(skipped);
        info!(
            table = table.name,
            pending = pending.len(),
            undecodable = pending.undecodable,
            "dispatching pending records"
        );

        let permits = Arc::new(Semaphore::new(self.worker_concurrency.get()));
        let mut tasks = JoinSet::new();
        for record in pending.records {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let worker = Arc::clone(&self.worker);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    worker.process(table, record).await
                }
                .in_current_span(),
            );
            while let Some(joined) = tasks.try_join_next() {
                self.absorb(table, &mut report, joined);
            }
        }
        while let Some(joined) = tasks.join_next().await {
            self.absorb(table, &mut report, joined);
        }

        info!(
            table = table.name,
            persisted = report.persisted,
            still_pending = report.still_pending(),
            "table finished"
        );
        report
    }

    fn absorb(
        &self,
        table: &RecordTable,
        report: &mut TableReport,
        joined: Result<RecordOutcome, JoinError>,
    ) {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(join_error) => {
                warn!(table = table.name, error = %join_error, "record worker task failed");
                self.metrics
                    .records_write_failed
                    .with_label_values(&[table.name])
                    .inc();
                report.record(RecordOutcome::WriteFailed);
            }
        }
    }
}
