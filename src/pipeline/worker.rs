use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{Instrument, debug, error, info_span, warn};

use super::ledger::RunLedger;
use super::resolver::{DependencyResolver, Resolution};
use super::writer::PersistenceWriter;
use crate::classifier::Classifier;
use crate::observability::metrics::Metrics;
use crate::store::{Record, RecordStore, RecordTable, ToxicityLabel, UnitOfWork};

/// レコード 1 件の処理結果。`Persisted` と `AlreadyHandled` 以外は保留のまま残る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Persisted,
    Indeterminate,
    MissingParent,
    ParentIndeterminate,
    WriteFailed,
    /// 同じ実行内でコメント側から既に書き込まれていた
    AlreadyHandled,
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Persisted => "persisted",
            Self::Indeterminate => "indeterminate",
            Self::MissingParent => "missing_parent",
            Self::ParentIndeterminate => "parent_indeterminate",
            Self::WriteFailed => "write_failed",
            Self::AlreadyHandled => "already_handled",
        };
        f.write_str(name)
    }
}

/// 分類 → 親解決 → 永続化を 1 レコード分実行するワーカー。
///
/// 分類はトランザクション開始前に行い、接続を HTTP 待ちで占有しない。
#[derive(Clone)]
pub struct RecordWorker {
    store: Arc<dyn RecordStore>,
    classifier: Arc<dyn Classifier>,
    resolver: DependencyResolver,
    writer: PersistenceWriter,
    ledger: RunLedger,
    metrics: Arc<Metrics>,
}

impl RecordWorker {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        classifier: Arc<dyn Classifier>,
        ledger: RunLedger,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(Arc::clone(&classifier)),
            store,
            classifier,
            writer: PersistenceWriter,
            ledger,
            metrics,
        }
    }

    /// レコードを処理する。エラーはすべてこの境界で結果に変換される。
    pub async fn process(&self, table: &'static RecordTable, record: Record) -> RecordOutcome {
        let span = info_span!("process_record", table = table.name, record_id = %record.id());
        self.process_inner(table, record).instrument(span).await
    }

    async fn process_inner(&self, table: &'static RecordTable, record: Record) -> RecordOutcome {
        if self.ledger.contains(table, record.id()) {
            debug!("record already persisted earlier in this run");
            return RecordOutcome::AlreadyHandled;
        }

        let started = Instant::now();
        let verdict = self.classifier.classify(record.text()).await;
        self.metrics
            .classify_duration
            .observe(started.elapsed().as_secs_f64());

        let Some(label) = verdict.label() else {
            warn!("classification indeterminate; record stays pending");
            self.metrics
                .records_indeterminate
                .with_label_values(&[table.name])
                .inc();
            return RecordOutcome::Indeterminate;
        };

        match self.persist(table, record, label).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(error = %format!("{error:#}"), "failed to persist record; unit rolled back");
                self.metrics
                    .records_write_failed
                    .with_label_values(&[table.name])
                    .inc();
                RecordOutcome::WriteFailed
            }
        }
    }

    async fn persist(
        &self,
        table: &'static RecordTable,
        record: Record,
        label: ToxicityLabel,
    ) -> Result<RecordOutcome> {
        let mut unit = self
            .store
            .begin()
            .await
            .context("failed to begin unit of work")?;

        let resolution = match self
            .resolver
            .ensure_parent_processed(unit.as_mut(), table, &record)
            .await
        {
            Ok(resolution) => resolution,
            Err(error) => {
                discard(unit).await;
                return Err(error);
            }
        };

        let (inherited, persisted_parent) = match resolution {
            Resolution::Resolved {
                inherited,
                persisted_parent,
            } => (inherited, persisted_parent),
            Resolution::MissingParent { .. } => {
                discard(unit).await;
                self.metrics
                    .records_missing_parent
                    .with_label_values(&[table.name])
                    .inc();
                return Ok(RecordOutcome::MissingParent);
            }
            Resolution::ParentIndeterminate { .. } => {
                discard(unit).await;
                self.metrics
                    .records_indeterminate
                    .with_label_values(&[table.name])
                    .inc();
                return Ok(RecordOutcome::ParentIndeterminate);
            }
        };

        let record = record.with_inherited(inherited);
        if let Err(error) = self
            .writer
            .upsert(unit.as_mut(), table, &record, label)
            .await
        {
            discard(unit).await;
            return Err(error);
        }
        unit.commit()
            .await
            .with_context(|| format!("failed to commit {} record {}", table.name, record.id()))?;

        if let (Some(parent_id), Some(link)) = (persisted_parent, table.parent) {
            self.ledger.mark_persisted(link.table, &parent_id);
            self.metrics
                .parents_resolved
                .with_label_values(&[table.name])
                .inc();
        }
        self.ledger.mark_persisted(table, record.id());
        self.metrics
            .records_persisted
            .with_label_values(&[table.name])
            .inc();
        debug!(toxic_analysis = label.as_flag(), "record persisted");

        Ok(RecordOutcome::Persisted)
    }
}

async fn discard(unit: Box<dyn UnitOfWork>) {
    if let Err(error) = unit.rollback().await {
        warn!(error = %format!("{error:#}"), "failed to roll back unit of work");
    }
}
