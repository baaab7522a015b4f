//! 分類対象テーブルの定義。
//!
//! パイプラインはテーブルごとに分かれておらず、`RecordTable` の値で
//! ソース・処理済みテーブル、カラムマッピング、親子関係を切り替える。

use std::fmt;
use std::str::FromStr;

/// レコードの種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Post,
    Comment,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Post => f.write_str("post"),
            Self::Comment => f.write_str("comment"),
        }
    }
}

/// コメントから親投稿への参照。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    /// 親 ID を保持するカラム
    pub column: &'static str,
    /// 親のテーブル定義
    pub table: &'static RecordTable,
    /// 親の処理済み行から引き継ぐカラム
    pub inherited: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTable {
    /// ログとメトリクスに使う短い名前
    pub name: &'static str,
    pub source: &'static str,
    pub processed: &'static str,
    pub id_column: &'static str,
    /// ID カラムの SQL 型（バインド時のキャスト先）
    pub id_type: &'static str,
    pub text_column: &'static str,
    /// ソースから処理済みテーブルへそのまま書き写すカラム
    pub columns: &'static [&'static str],
    pub label_column: &'static str,
    pub parent: Option<ParentLink>,
    /// 本文が NULL の行を対象外にする
    pub skip_null_text: bool,
}

impl RecordTable {
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        if self.parent.is_some() {
            RecordKind::Comment
        } else {
            RecordKind::Post
        }
    }

    /// 処理済みテーブルに書き込むカラム（ラベルを除く）。
    #[must_use]
    pub fn processed_columns(&self) -> Vec<&'static str> {
        let inherited = self.parent.map_or(&[][..], |link| link.inherited);
        self.columns
            .iter()
            .chain(inherited.iter())
            .copied()
            .collect()
    }
}

pub static REDDIT_POSTS: RecordTable = RecordTable {
    name: "reddit_posts",
    source: "public.reddit_posts",
    processed: "public.processed_reddit_posts",
    id_column: "id",
    id_type: "text",
    text_column: "body",
    columns: &[
        "id",
        "title",
        "body",
        "created_utc",
        "score",
        "url",
        "subreddit",
    ],
    label_column: "toxic_analysis",
    parent: None,
    skip_null_text: false,
};

pub static REDDIT_COMMENTS: RecordTable = RecordTable {
    name: "reddit_comments",
    source: "public.reddit_comments",
    processed: "public.processed_reddit_comments",
    id_column: "id",
    id_type: "text",
    text_column: "body",
    columns: &["id", "post_id", "body", "created_utc", "score"],
    label_column: "toxic_analysis",
    parent: Some(ParentLink {
        column: "post_id",
        table: &REDDIT_POSTS,
        inherited: &["subreddit"],
    }),
    skip_null_text: false,
};

pub static CHANPOSTS: RecordTable = RecordTable {
    name: "chanposts",
    source: "four_chan_schema.chanposts",
    processed: "four_chan_schema.processed_chanposts",
    id_column: "post_id",
    id_type: "bigint",
    text_column: "comment",
    columns: &[
        "post_id",
        "name",
        "comment",
        "filename",
        "ext",
        "w",
        "h",
        "time",
        "resto",
        "board_name",
    ],
    label_column: "toxic_analysis",
    parent: None,
    skip_null_text: true,
};

static REDDIT_TABLES: [&RecordTable; 2] = [&REDDIT_POSTS, &REDDIT_COMMENTS];
static FOURCHAN_TABLES: [&RecordTable; 1] = [&CHANPOSTS];

/// クローラー単位のテーブル群。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Reddit,
    FourChan,
}

impl Domain {
    #[must_use]
    pub fn tables(self) -> &'static [&'static RecordTable] {
        match self {
            Self::Reddit => &REDDIT_TABLES,
            Self::FourChan => &FOURCHAN_TABLES,
        }
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reddit" => Ok(Self::Reddit),
            "fourchan" | "4chan" => Ok(Self::FourChan),
            other => Err(format!("unknown domain: {other}")),
        }
    }
}
