use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{RecordId, RecordTable};

/// 1 回の実行中に永続化されたレコードの記録。
///
/// 投稿がコメント側で先に処理された場合に、投稿ワーカーが同じレコードを
/// 再分類しないための目印。コミット済みの行だけを記録する。
#[derive(Debug, Clone, Default)]
pub struct RunLedger {
    persisted: Arc<Mutex<HashSet<(&'static str, RecordId)>>>,
}

impl RunLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_persisted(&self, table: &RecordTable, id: &RecordId) {
        self.lock().insert((table.name, id.clone()));
    }

    #[must_use]
    pub fn contains(&self, table: &RecordTable, id: &RecordId) -> bool {
        self.lock().contains(&(table.name, id.clone()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(&'static str, RecordId)>> {
        self.persisted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
