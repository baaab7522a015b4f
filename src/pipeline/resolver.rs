use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::writer::PersistenceWriter;
use crate::classifier::{Classifier, Verdict};
use crate::store::{Record, RecordId, RecordTable, UnitOfWork};

/// コメントの親投稿に対する解決結果。
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 親が処理済み、または親を持たない。`inherited` はコメント行に引き継ぐカラム。
    Resolved {
        inherited: Map<String, Value>,
        /// この作業単位で新たに書き込んだ親の ID
        persisted_parent: Option<RecordId>,
    },
    /// 親の生レコードが存在しない、または親 ID が空。コメントは保留のまま。
    MissingParent { parent_id: Option<RecordId> },
    /// 親の分類が確定しなかった。コメントは保留のまま。
    ParentIndeterminate { parent_id: RecordId },
}

impl Resolution {
    fn standalone() -> Self {
        Self::Resolved {
            inherited: Map::new(),
            persisted_parent: None,
        }
    }
}

/// コメントのコミット前に親投稿が処理済みであることを保証する。
#[derive(Clone)]
pub struct DependencyResolver {
    classifier: Arc<dyn Classifier>,
    writer: PersistenceWriter,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            classifier,
            writer: PersistenceWriter,
        }
    }

    /// 親を確認し、未処理なら同じ作業単位の中で分類して書き込む。
    ///
    /// 親の書き込みはコメントと同じトランザクションに載るため、
    /// 両方が同時に可視になるか、どちらも書かれないかのいずれかになる。
    ///
    /// # Errors
    /// ストアへの問い合わせ、または親の upsert に失敗した場合。
    pub async fn ensure_parent_processed(
        &self,
        unit: &mut dyn UnitOfWork,
        table: &RecordTable,
        record: &Record,
    ) -> Result<Resolution> {
        let Some(link) = table.parent else {
            return Ok(Resolution::standalone());
        };
        let Some(parent_id) = record.parent_id() else {
            warn!(
                table = table.name,
                record_id = %record.id(),
                parent_column = link.column,
                "comment has no parent id; skipping comment"
            );
            return Ok(Resolution::MissingParent { parent_id: None });
        };

        if let Some(inherited) = unit
            .processed_fields(link.table, parent_id, link.inherited)
            .await
            .with_context(|| format!("failed to look up processed parent {parent_id}"))?
        {
            debug!(
                table = table.name,
                record_id = %record.id(),
                parent_id = %parent_id,
                "parent already processed"
            );
            return Ok(Resolution::Resolved {
                inherited,
                persisted_parent: None,
            });
        }

        let Some(parent) = unit
            .fetch_record(link.table, parent_id)
            .await
            .with_context(|| format!("failed to fetch parent record {parent_id}"))?
        else {
            warn!(
                table = table.name,
                record_id = %record.id(),
                parent_id = %parent_id,
                "parent record not found; skipping comment"
            );
            return Ok(Resolution::MissingParent {
                parent_id: Some(parent_id.clone()),
            });
        };

        match self.classifier.classify(parent.text()).await {
            Verdict::Label(label) => {
                self.writer
                    .upsert(unit, link.table, &parent, label)
                    .await?;
                info!(
                    table = table.name,
                    record_id = %record.id(),
                    parent_id = %parent_id,
                    toxic_analysis = label.as_flag(),
                    "classified parent ahead of comment"
                );
                Ok(Resolution::Resolved {
                    inherited: parent.project(link.inherited),
                    persisted_parent: Some(parent_id.clone()),
                })
            }
            Verdict::Indeterminate => {
                warn!(
                    table = table.name,
                    record_id = %record.id(),
                    parent_id = %parent_id,
                    "parent classification indeterminate; comment stays pending"
                );
                Ok(Resolution::ParentIndeterminate {
                    parent_id: parent_id.clone(),
                })
            }
        }
    }
}
