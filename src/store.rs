#[cfg(test)]
pub(crate) mod memory;
pub mod models;
pub mod postgres;
pub(crate) mod sql;
pub mod tables;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub use self::models::{PendingBatch, Record, RecordId, ToxicityLabel};
pub use self::tables::RecordTable;

/// 生レコードと処理済みレコードを保持するストア。
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 処理済みテーブルに存在しないレコードを取得する。
    ///
    /// 差集合はストア側で計算され、処理済みの行はクライアントに転送されない。
    /// 変換できない行はバッチ全体を失敗させず、`undecodable` に数えられる。
    async fn fetch_pending(&self, table: &RecordTable) -> Result<PendingBatch>;

    /// レコード 1 件分の作業単位を開始する。
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// 疎通確認。
    async fn ping(&self) -> Result<()>;
}

/// レコード 1 件の処理に専有されるトランザクション。
///
/// commit されずに drop された場合は書き込みが破棄される。
#[async_trait]
pub trait UnitOfWork: Send {
    /// ID で生レコードを取得する。
    async fn fetch_record(&mut self, table: &RecordTable, id: &RecordId)
    -> Result<Option<Record>>;

    /// 処理済みレコードが存在すれば、指定カラムの値を返す。
    async fn processed_fields(
        &mut self,
        table: &RecordTable,
        id: &RecordId,
        columns: &[&str],
    ) -> Result<Option<Map<String, Value>>>;

    /// 処理済みテーブルへ upsert する。
    async fn upsert_processed(
        &mut self,
        table: &RecordTable,
        record: &Record,
        label: ToxicityLabel,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
