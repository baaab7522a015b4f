use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::tables::RecordTable;

/// ソーステーブル内で一意なレコード ID。
///
/// 数値 ID（4chan の `post_id`）も文字列として保持する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 判定ラベル。処理済みテーブルには 1 / 0 で保存される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToxicityLabel {
    Toxic,
    NotToxic,
}

impl ToxicityLabel {
    #[must_use]
    pub const fn as_flag(self) -> i32 {
        match self {
            Self::Toxic => 1,
            Self::NotToxic => 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordDecodeError {
    #[error("row from {table} is not a JSON object")]
    NotAnObject { table: &'static str },
    #[error("row from {table} has no usable `{column}` identifier")]
    MissingId {
        table: &'static str,
        column: &'static str,
    },
}

/// 分類対象の投稿またはコメント。
///
/// `fields` にはテーブル定義でマッピングされたカラムがそのまま入り、
/// 処理済みテーブルへ無加工で引き継がれる。
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    parent_id: Option<RecordId>,
    text: String,
    fields: Map<String, Value>,
}

impl Record {
    /// `jsonb_build_object` で組み立てた行を `Record` に変換する。
    ///
    /// # Errors
    /// 行がオブジェクトでない場合、または ID カラムが空の場合。
    pub fn from_row(table: &RecordTable, row: Value) -> Result<Self, RecordDecodeError> {
        let Value::Object(fields) = row else {
            return Err(RecordDecodeError::NotAnObject { table: table.name });
        };

        let id = fields
            .get(table.id_column)
            .and_then(RecordId::from_json)
            .ok_or(RecordDecodeError::MissingId {
                table: table.name,
                column: table.id_column,
            })?;
        let parent_id = table
            .parent
            .as_ref()
            .and_then(|link| fields.get(link.column))
            .and_then(RecordId::from_json);
        let text = fields
            .get(table.text_column)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            id,
            parent_id,
            text,
            fields,
        })
    }

    #[must_use]
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&RecordId> {
        self.parent_id.as_ref()
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// 親から引き継いだカラムを上書きでマージする。
    #[must_use]
    pub fn with_inherited(mut self, inherited: Map<String, Value>) -> Self {
        self.fields.extend(inherited);
        self
    }

    /// 指定カラムだけを抜き出す。存在しないカラムは `null` になる。
    #[must_use]
    pub fn project(&self, columns: &[&str]) -> Map<String, Value> {
        columns
            .iter()
            .map(|column| {
                let value = self.fields.get(*column).cloned().unwrap_or(Value::Null);
                ((*column).to_string(), value)
            })
            .collect()
    }

    /// upsert 用のペイロード（マッピング済みカラム + ラベル）。
    #[must_use]
    pub fn processed_payload(&self, table: &RecordTable, label: ToxicityLabel) -> Value {
        let mut payload = self.project(&table.processed_columns());
        payload.insert(table.label_column.to_string(), Value::from(label.as_flag()));
        Value::Object(payload)
    }
}

/// 保留レコードの取得結果。変換できなかった行は件数だけ残す。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    pub records: Vec<Record>,
    pub undecodable: usize,
}

impl PendingBatch {
    /// 行を 1 件ずつ変換する。変換できない行は警告して読み飛ばす。
    #[must_use]
    pub fn decode(table: &RecordTable, rows: Vec<Value>) -> Self {
        let mut batch = Self {
            records: Vec::with_capacity(rows.len()),
            undecodable: 0,
        };
        for row in rows {
            match Record::from_row(table, row) {
                Ok(record) => batch.records.push(record),
                Err(error) => {
                    warn!(table = table.name, %error, "skipping undecodable row");
                    batch.undecodable += 1;
                }
            }
        }
        batch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
