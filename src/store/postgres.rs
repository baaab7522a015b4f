use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use super::models::{PendingBatch, Record, RecordId, ToxicityLabel};
use super::tables::RecordTable;
use super::{RecordStore, UnitOfWork, sql};

/// PostgreSQL 上のソース／処理済みテーブルを扱うストア。
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    batch_limit: Option<i64>,
}

impl PgRecordStore {
    #[must_use]
    pub fn new(pool: PgPool, batch_limit: Option<i64>) -> Self {
        Self { pool, batch_limit }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn read_record(table: &RecordTable, row: &PgRow) -> Result<Value> {
    let Json(value): Json<Value> = row
        .try_get("record")
        .with_context(|| format!("failed to read {} row", table.name))?;
    Ok(value)
}

fn decode_rows(table: &RecordTable, rows: &[PgRow]) -> PendingBatch {
    let mut unreadable = 0;
    let values = rows
        .iter()
        .filter_map(|row| match read_record(table, row) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(table = table.name, error = %format!("{error:#}"), "skipping unreadable row");
                unreadable += 1;
                None
            }
        })
        .collect();

    let mut batch = PendingBatch::decode(table, values);
    batch.undecodable += unreadable;
    batch
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn fetch_pending(&self, table: &RecordTable) -> Result<PendingBatch> {
        let sql = sql::pending_query(table, self.batch_limit.is_some());
        let mut query = sqlx::query(&sql);
        if let Some(limit) = self.batch_limit {
            query = query.bind(limit);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to fetch pending rows from {}", table.source))?;

        debug!(table = table.name, count = rows.len(), "fetched pending rows");
        Ok(decode_rows(table, &rows))
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

/// プールから取得した接続上のトランザクション。
///
/// drop 時に sqlx がロールバックして接続をプールに返す。
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn fetch_record(
        &mut self,
        table: &RecordTable,
        id: &RecordId,
    ) -> Result<Option<Record>> {
        let sql = sql::record_by_id_query(table);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .with_context(|| format!("failed to fetch {} row {id}", table.source))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = Record::from_row(table, read_record(table, &row)?)?;
        Ok(Some(record))
    }

    async fn processed_fields(
        &mut self,
        table: &RecordTable,
        id: &RecordId,
        columns: &[&str],
    ) -> Result<Option<Map<String, Value>>> {
        let sql = sql::processed_fields_query(table, columns);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .with_context(|| format!("failed to look up {} row {id}", table.processed))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(fields): Json<Map<String, Value>> = row
            .try_get("fields")
            .context("failed to read processed fields")?;
        Ok(Some(fields))
    }

    async fn upsert_processed(
        &mut self,
        table: &RecordTable,
        record: &Record,
        label: ToxicityLabel,
    ) -> Result<()> {
        let sql = sql::upsert_query(table);
        sqlx::query(&sql)
            .bind(Json(record.processed_payload(table, label)))
            .execute(&mut *self.tx)
            .await
            .with_context(|| {
                format!("failed to upsert {} row {}", table.processed, record.id())
            })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to rollback transaction")
    }
}
