//! Prometheusメトリクス定義。

use prometheus::{
    Counter, CounterVec, Gauge, Histogram, Registry, register_counter_vec_with_registry,
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry,
};

/// メトリクスコレクター。テーブル別のカウンターは `table` ラベルを持つ。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub records_fetched: CounterVec,
    pub records_undecodable: CounterVec,
    pub records_persisted: CounterVec,
    pub records_indeterminate: CounterVec,
    pub records_missing_parent: CounterVec,
    pub records_write_failed: CounterVec,
    pub parents_resolved: CounterVec,
    pub fetch_failures: CounterVec,
    pub runs_completed: Counter,

    // ヒストグラム
    pub classify_duration: Histogram,
    pub run_duration: Histogram,

    // ゲージ
    pub active_runs: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同じレジストリに同名のメトリクスが登録済みの場合。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            records_fetched: register_counter_vec_with_registry!(
                "toxicity_records_fetched_total",
                "Pending records fetched from the source tables",
                &["table"],
                registry
            )?,
            records_undecodable: register_counter_vec_with_registry!(
                "toxicity_records_undecodable_total",
                "Pending rows skipped because they could not be decoded",
                &["table"],
                registry
            )?,
            records_persisted: register_counter_vec_with_registry!(
                "toxicity_records_persisted_total",
                "Records classified and upserted into the processed tables",
                &["table"],
                registry
            )?,
            records_indeterminate: register_counter_vec_with_registry!(
                "toxicity_records_indeterminate_total",
                "Records left pending because the classifier could not be reached",
                &["table"],
                registry
            )?,
            records_missing_parent: register_counter_vec_with_registry!(
                "toxicity_records_missing_parent_total",
                "Comments skipped because their parent post does not exist",
                &["table"],
                registry
            )?,
            records_write_failed: register_counter_vec_with_registry!(
                "toxicity_records_write_failed_total",
                "Records whose transaction was rolled back",
                &["table"],
                registry
            )?,
            parents_resolved: register_counter_vec_with_registry!(
                "toxicity_parents_resolved_total",
                "Parent posts classified on demand for a comment",
                &["table"],
                registry
            )?,
            fetch_failures: register_counter_vec_with_registry!(
                "toxicity_fetch_failures_total",
                "Failed pending-record queries",
                &["table"],
                registry
            )?,
            runs_completed: register_counter_with_registry!(
                "toxicity_runs_completed_total",
                "Completed pipeline runs",
                registry
            )?,
            classify_duration: register_histogram_with_registry!(
                "toxicity_classify_duration_seconds",
                "Latency of one classification including retries",
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                "toxicity_run_duration_seconds",
                "Duration of an entire pipeline run",
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "toxicity_active_runs",
                "Number of pipeline runs in progress",
                registry
            )?,
        })
    }
}
