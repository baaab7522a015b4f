//! `RecordTable` から SQL 文を組み立てる。
//!
//! 識別子はすべて `tables.rs` の静的定義から来るため、外部入力は含まれない。

use super::tables::RecordTable;

fn json_object(alias: &str, columns: &[&str]) -> String {
    let pairs = columns
        .iter()
        .map(|column| format!("'{column}', {alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("jsonb_build_object({pairs})")
}

/// 未処理レコードを差集合（NOT EXISTS）で取得する。
///
/// `limited` の場合は `$1` に件数上限をバインドする。
pub(crate) fn pending_query(table: &RecordTable, limited: bool) -> String {
    let mut sql = format!(
        "SELECT {record} AS record FROM {source} AS r \
         WHERE NOT EXISTS (SELECT 1 FROM {processed} AS p WHERE p.{id} = r.{id})",
        record = json_object("r", table.columns),
        source = table.source,
        processed = table.processed,
        id = table.id_column,
    );
    if table.skip_null_text {
        sql.push_str(&format!(" AND r.{} IS NOT NULL", table.text_column));
    }
    sql.push_str(&format!(" ORDER BY r.{}", table.id_column));
    if limited {
        sql.push_str(" LIMIT $1");
    }
    sql
}

/// ID で生レコードを 1 件取得する。
pub(crate) fn record_by_id_query(table: &RecordTable) -> String {
    format!(
        "SELECT {record} AS record FROM {source} AS r WHERE r.{id} = CAST($1 AS {id_type})",
        record = json_object("r", table.columns),
        source = table.source,
        id = table.id_column,
        id_type = table.id_type,
    )
}

/// 処理済み行の存在確認と、指定カラムの取得。
pub(crate) fn processed_fields_query(table: &RecordTable, columns: &[&str]) -> String {
    format!(
        "SELECT {fields} AS fields FROM {processed} AS p WHERE p.{id} = CAST($1 AS {id_type})",
        fields = json_object("p", columns),
        processed = table.processed,
        id = table.id_column,
        id_type = table.id_type,
    )
}

/// 処理済みテーブルへの upsert。
///
/// `$1` は `Record::processed_payload` の JSONB。カラム型の変換は
/// `jsonb_populate_record` に任せる。衝突時は全カラムとラベルを更新する。
pub(crate) fn upsert_query(table: &RecordTable) -> String {
    let mut columns = table.processed_columns();
    columns.push(table.label_column);

    let column_list = columns.join(", ");
    let updates = columns
        .iter()
        .filter(|column| **column != table.id_column)
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {processed} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_record(NULL::{processed}, $1) \
         ON CONFLICT ({id}) DO UPDATE SET {updates}",
        processed = table.processed,
        id = table.id_column,
    )
}
