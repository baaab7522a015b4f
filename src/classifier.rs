pub mod client;
pub mod response;

use async_trait::async_trait;

pub use self::client::{ModerationClient, ModerationConfig, ModerationError};
pub use self::response::ModerationResponse;
pub use crate::store::ToxicityLabel;

/// 分類の最終結果。
///
/// `Indeterminate` は再試行を使い切ったことを表し、保存されない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Label(ToxicityLabel),
    Indeterminate,
}

impl Verdict {
    #[must_use]
    pub const fn label(self) -> Option<ToxicityLabel> {
        match self {
            Self::Label(label) => Some(label),
            Self::Indeterminate => None,
        }
    }
}

/// テキスト 1 件を分類する外部サービス。
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Verdict;
}
