// テスト用のインメモリ RecordStore。
// 書き込みは commit まで作業単位内にバッファされる。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::models::{PendingBatch, Record, RecordId, ToxicityLabel};
use super::tables::RecordTable;
use super::{RecordStore, UnitOfWork};

type Rows = BTreeMap<RecordId, Map<String, Value>>;

#[derive(Default)]
struct State {
    raw: HashMap<&'static str, BTreeMap<RecordId, Record>>,
    undecodable: HashMap<&'static str, Vec<Value>>,
    processed: HashMap<&'static str, Rows>,
    failing_writes: HashSet<RecordId>,
    upserts: usize,
    commits: usize,
    rollbacks: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_raw(&self, table: &RecordTable, row: Value) -> RecordId {
        let record = Record::from_row(table, row).expect("test row should decode");
        let id = record.id().clone();
        self.lock()
            .raw
            .entry(table.name)
            .or_default()
            .insert(id.clone(), record);
        id
    }

    /// `Record` に変換できない生の行を置く。取得のたびに読み飛ばされる。
    pub(crate) fn insert_undecodable(&self, table: &RecordTable, row: Value) {
        self.lock()
            .undecodable
            .entry(table.name)
            .or_default()
            .push(row);
    }

    /// 処理済み行を直接書き込む。
    pub(crate) fn insert_processed(&self, table: &RecordTable, row: Value) {
        let record = Record::from_row(table, row).expect("test row should decode");
        let payload = match record.processed_payload(table, ToxicityLabel::NotToxic) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        self.lock()
            .processed
            .entry(table.processed)
            .or_default()
            .insert(record.id().clone(), payload);
    }

    pub(crate) fn fail_writes_for(&self, id: &str) {
        self.lock().failing_writes.insert(RecordId::new(id));
    }

    pub(crate) fn processed_row(&self, table: &RecordTable, id: &str) -> Option<Map<String, Value>> {
        self.lock()
            .processed
            .get(table.processed)
            .and_then(|rows| rows.get(&RecordId::new(id)))
            .cloned()
    }

    pub(crate) fn processed_count(&self, table: &RecordTable) -> usize {
        self.lock()
            .processed
            .get(table.processed)
            .map_or(0, BTreeMap::len)
    }

    pub(crate) fn upserts(&self) -> usize {
        self.lock().upserts
    }

    pub(crate) fn commits(&self) -> usize {
        self.lock().commits
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock")
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_pending(&self, table: &RecordTable) -> Result<PendingBatch> {
        let state = self.lock();
        let broken = state.undecodable.get(table.name).cloned().unwrap_or_default();
        let mut batch = PendingBatch::decode(table, broken);
        let processed = state.processed.get(table.processed);
        let pending = state
            .raw
            .get(table.name)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|record| processed.is_none_or(|rows| !rows.contains_key(record.id())))
            .filter(|record| {
                !table.skip_null_text
                    || record
                        .fields()
                        .get(table.text_column)
                        .is_some_and(|value| !value.is_null())
            })
            .cloned();
        batch.records.extend(pending);
        Ok(batch)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            store: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryUnitOfWork {
    store: MemoryStore,
    staged: Vec<(&'static str, RecordId, Map<String, Value>)>,
}

impl MemoryUnitOfWork {
    fn staged_row(&self, processed: &str, id: &RecordId) -> Option<&Map<String, Value>> {
        self.staged
            .iter()
            .rev()
            .find(|(table, staged_id, _)| *table == processed && staged_id == id)
            .map(|(_, _, row)| row)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn fetch_record(
        &mut self,
        table: &RecordTable,
        id: &RecordId,
    ) -> Result<Option<Record>> {
        Ok(self
            .store
            .lock()
            .raw
            .get(table.name)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn processed_fields(
        &mut self,
        table: &RecordTable,
        id: &RecordId,
        columns: &[&str],
    ) -> Result<Option<Map<String, Value>>> {
        let row = match self.staged_row(table.processed, id) {
            Some(row) => Some(row.clone()),
            None => self
                .store
                .lock()
                .processed
                .get(table.processed)
                .and_then(|rows| rows.get(id))
                .cloned(),
        };

        Ok(row.map(|row| {
            columns
                .iter()
                .map(|column| {
                    let value = row.get(*column).cloned().unwrap_or(Value::Null);
                    ((*column).to_string(), value)
                })
                .collect()
        }))
    }

    async fn upsert_processed(
        &mut self,
        table: &RecordTable,
        record: &Record,
        label: ToxicityLabel,
    ) -> Result<()> {
        {
            let mut state = self.store.lock();
            state.upserts += 1;
            if state.failing_writes.contains(record.id()) {
                bail!("simulated constraint violation for {}", record.id());
            }
        }

        let Value::Object(payload) = record.processed_payload(table, label) else {
            bail!("payload must be an object");
        };
        self.staged
            .push((table.processed, record.id().clone(), payload));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.store.lock();
        state.commits += 1;
        for (table, id, row) in this.staged {
            state.processed.entry(table).or_default().insert(id, row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}
