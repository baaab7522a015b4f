use anyhow::{Context, Result};
use tracing::debug;

use crate::store::{Record, RecordTable, ToxicityLabel, UnitOfWork};

/// 処理済みテーブルへの書き込み。
///
/// 主キー衝突時は全カラムを更新するため、同じレコードを何度書いても
/// 行は 1 つに保たれる。`Verdict::Indeterminate` は型の上で受け付けない。
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceWriter;

impl PersistenceWriter {
    /// # Errors
    /// 作業単位での upsert に失敗した場合。呼び出し側でロールバックすること。
    pub async fn upsert(
        &self,
        unit: &mut dyn UnitOfWork,
        table: &RecordTable,
        record: &Record,
        label: ToxicityLabel,
    ) -> Result<()> {
        unit.upsert_processed(table, record, label)
            .await
            .with_context(|| {
                format!(
                    "failed to upsert processed {} record {}",
                    table.name,
                    record.id()
                )
            })?;
        debug!(
            table = table.name,
            record_id = %record.id(),
            toxic_analysis = label.as_flag(),
            "staged processed record"
        );
        Ok(())
    }
}
