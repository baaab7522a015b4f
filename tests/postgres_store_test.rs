//! PostgreSQL を使う結合テスト。`DATABASE_URL` が未設定ならスキップする。

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use toxicity_worker::classifier::{Classifier, ToxicityLabel, Verdict};
use toxicity_worker::observability::Telemetry;
use toxicity_worker::pipeline::Pipeline;
use toxicity_worker::store::postgres::PgRecordStore;
use toxicity_worker::store::tables::{ParentLink, RecordTable};
use toxicity_worker::store::{Record, RecordStore, UnitOfWork};

struct AlwaysToxic;

#[async_trait]
impl Classifier for AlwaysToxic {
    async fn classify(&self, _text: &str) -> Verdict {
        Verdict::Label(ToxicityLabel::Toxic)
    }
}

/// 指定した本文だけ判定が確定しない分類器。
struct UndecidedOn(&'static str);

#[async_trait]
impl Classifier for UndecidedOn {
    async fn classify(&self, text: &str) -> Verdict {
        if text == self.0 {
            Verdict::Indeterminate
        } else {
            Verdict::Label(ToxicityLabel::NotToxic)
        }
    }
}

struct Fixture {
    pool: PgPool,
    schema: String,
    posts: &'static RecordTable,
    comments: &'static RecordTable,
}

fn leak(value: String) -> &'static str {
    Box::leak(value.into_boxed_str())
}

async fn fixture() -> Option<Fixture> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres store test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");

    let schema = format!("toxicity_it_{}", uuid::Uuid::new_v4().simple());
    for statement in [
        format!("CREATE SCHEMA {schema}"),
        format!(
            "CREATE TABLE {schema}.posts (id text PRIMARY KEY, title text, body text, \
             created_utc bigint, score integer, url text, subreddit text)"
        ),
        format!(
            "CREATE TABLE {schema}.processed_posts (id text PRIMARY KEY, title text, body text, \
             created_utc bigint, score integer, url text, subreddit text, toxic_analysis integer)"
        ),
        format!(
            "CREATE TABLE {schema}.comments (id text PRIMARY KEY, post_id text, body text, \
             created_utc bigint, score integer)"
        ),
        format!(
            "CREATE TABLE {schema}.processed_comments (id text PRIMARY KEY, post_id text, \
             body text, created_utc bigint, score integer, subreddit text, toxic_analysis integer)"
        ),
        format!(
            "INSERT INTO {schema}.posts VALUES \
             ('p1', 'first', 'post one', 1700000000, 3, NULL, 'rust'), \
             ('p2', 'second', NULL, 1700000001, 1, 'https://example.com', 'golang')"
        ),
        format!(
            "INSERT INTO {schema}.comments VALUES \
             ('c1', 'p1', 'reply', 1700000100, 2), \
             ('c2', 'ghost', 'orphan', 1700000200, 0)"
        ),
    ] {
        sqlx::query(&statement)
            .execute(&pool)
            .await
            .expect("fixture statement");
    }

    let posts: &'static RecordTable = Box::leak(Box::new(RecordTable {
        name: "it_posts",
        source: leak(format!("{schema}.posts")),
        processed: leak(format!("{schema}.processed_posts")),
        id_column: "id",
        id_type: "text",
        text_column: "body",
        columns: &["id", "title", "body", "created_utc", "score", "url", "subreddit"],
        label_column: "toxic_analysis",
        parent: None,
        skip_null_text: false,
    }));
    let comments: &'static RecordTable = Box::leak(Box::new(RecordTable {
        name: "it_comments",
        source: leak(format!("{schema}.comments")),
        processed: leak(format!("{schema}.processed_comments")),
        id_column: "id",
        id_type: "text",
        text_column: "body",
        columns: &["id", "post_id", "body", "created_utc", "score"],
        label_column: "toxic_analysis",
        parent: Some(ParentLink {
            column: "post_id",
            table: posts,
            inherited: &["subreddit"],
        }),
        skip_null_text: false,
    }));

    Some(Fixture {
        pool,
        schema,
        posts,
        comments,
    })
}

impl Fixture {
    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}.{table}", self.schema))
            .fetch_one(&self.pool)
            .await
            .expect("count query")
    }

    async fn execute(&self, statement: &str) {
        sqlx::query(&statement.replace("{schema}", &self.schema))
            .execute(&self.pool)
            .await
            .expect("statement");
    }

    fn pipeline(
        &self,
        store: Arc<PgRecordStore>,
        classifier: Arc<dyn Classifier>,
        tables: Vec<&'static RecordTable>,
    ) -> Pipeline {
        let telemetry = Telemetry::metrics_only().expect("telemetry");
        Pipeline::new(
            store,
            classifier,
            tables,
            NonZeroUsize::new(4).expect("non-zero"),
            NonZeroUsize::new(2).expect("non-zero"),
            telemetry.metrics_arc(),
        )
    }

    async fn teardown(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.pool)
            .await
            .expect("drop schema");
    }
}

#[tokio::test]
async fn pipeline_persists_parents_and_shrinks_pending_set() {
    let Some(fixture) = fixture().await else {
        return;
    };
    let store = Arc::new(PgRecordStore::new(fixture.pool.clone(), None));
    let pipeline = fixture.pipeline(
        store.clone(),
        Arc::new(AlwaysToxic),
        vec![fixture.comments, fixture.posts],
    );

    let first = pipeline.run_pipeline().await;

    assert_eq!(first.table("it_comments").map(|t| t.missing_parent), Some(1));
    assert_eq!(fixture.count("processed_posts").await, 2);
    assert_eq!(fixture.count("processed_comments").await, 1);

    let (subreddit, label): (Option<String>, Option<i32>) = sqlx::query_as(&format!(
        "SELECT subreddit, toxic_analysis FROM {}.processed_comments WHERE id = 'c1'",
        fixture.schema
    ))
    .fetch_one(&fixture.pool)
    .await
    .expect("comment row");
    assert_eq!(subreddit.as_deref(), Some("rust"));
    assert_eq!(label, Some(1));

    let pending = store
        .fetch_pending(fixture.comments)
        .await
        .expect("pending comments");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending.records[0].id().as_str(), "c2");
    assert!(store.fetch_pending(fixture.posts).await.expect("pending posts").is_empty());

    let second = pipeline.run_pipeline().await;
    assert_eq!(second.total_persisted(), 0);

    fixture.teardown().await;
}

#[tokio::test]
async fn upsert_is_idempotent_and_updates_on_conflict() {
    let Some(fixture) = fixture().await else {
        return;
    };
    let store = PgRecordStore::new(fixture.pool.clone(), Some(1));

    let limited = store.fetch_pending(fixture.posts).await.expect("pending");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited.records[0].id().as_str(), "p1");

    let record: Record = limited.records.into_iter().next().expect("record");
    for label in [ToxicityLabel::NotToxic, ToxicityLabel::Toxic] {
        let mut unit = store.begin().await.expect("begin");
        unit.upsert_processed(fixture.posts, &record, label)
            .await
            .expect("upsert");
        unit.commit().await.expect("commit");
    }

    assert_eq!(fixture.count("processed_posts").await, 1);
    let label: Option<i32> = sqlx::query_scalar(&format!(
        "SELECT toxic_analysis FROM {}.processed_posts WHERE id = 'p1'",
        fixture.schema
    ))
    .fetch_one(&fixture.pool)
    .await
    .expect("label");
    assert_eq!(label, Some(1));

    let mut unit = store.begin().await.expect("begin");
    let fields = unit
        .processed_fields(fixture.posts, record.id(), &["subreddit"])
        .await
        .expect("lookup");
    unit.rollback().await.expect("rollback");
    assert_eq!(
        fields.and_then(|f| f.get("subreddit").cloned()),
        Some(serde_json::json!("rust"))
    );

    fixture.teardown().await;
}

#[tokio::test]
async fn indeterminate_parent_keeps_comment_unpersisted() {
    let Some(fixture) = fixture().await else {
        return;
    };
    let store = Arc::new(PgRecordStore::new(fixture.pool.clone(), None));
    let pipeline = fixture.pipeline(
        store.clone(),
        Arc::new(UndecidedOn("post one")),
        vec![fixture.comments],
    );

    let report = pipeline.run_pipeline().await;

    let comments = report.table("it_comments").expect("comments report");
    assert_eq!(comments.parent_indeterminate, 1);
    assert_eq!(comments.missing_parent, 1);
    assert_eq!(comments.persisted, 0);
    assert_eq!(fixture.count("processed_posts").await, 0);
    assert_eq!(fixture.count("processed_comments").await, 0);
    let pending = store
        .fetch_pending(fixture.comments)
        .await
        .expect("pending comments");
    assert_eq!(pending.len(), 2);

    fixture.teardown().await;
}

#[tokio::test]
async fn blank_ids_are_skipped_without_failing_the_table() {
    let Some(fixture) = fixture().await else {
        return;
    };
    fixture
        .execute(
            "INSERT INTO {schema}.posts VALUES ('', 'blank', 'no id', 1700000002, 0, NULL, 'rust')",
        )
        .await;
    fixture
        .execute(
            "INSERT INTO {schema}.comments VALUES \
             ('c3', NULL, 'null parent', 1700000300, 0), \
             ('c4', '', 'blank parent', 1700000400, 0)",
        )
        .await;
    let store = Arc::new(PgRecordStore::new(fixture.pool.clone(), None));

    let posts = store.fetch_pending(fixture.posts).await.expect("pending posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts.undecodable, 1);

    let pipeline = fixture.pipeline(
        store.clone(),
        Arc::new(AlwaysToxic),
        vec![fixture.comments],
    );
    let report = pipeline.run_pipeline().await;

    let comments = report.table("it_comments").expect("comments report");
    assert!(!comments.fetch_failed);
    assert_eq!(comments.persisted, 1);
    assert_eq!(comments.missing_parent, 3);
    let orphans: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}.processed_comments WHERE id IN ('c3', 'c4')",
        fixture.schema
    ))
    .fetch_one(&fixture.pool)
    .await
    .expect("orphan count");
    assert_eq!(orphans, 0);

    fixture.teardown().await;
}
