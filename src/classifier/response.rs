use serde::{Deserialize, Deserializer};

use super::ToxicityLabel;

/// 有害と判定するクラス名。
pub const FLAG_CLASS: &str = "flag";

/// モデレーション API のレスポンス。
///
/// `confidence` は数値でも数値文字列でも返ってくる。欠落時は 0 とみなす。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModerationResponse {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub confidence: f64,
}

impl ModerationResponse {
    /// `class == "flag"` かつ `confidence > threshold` のときのみ有害。
    #[must_use]
    pub fn decide(&self, threshold: f64) -> ToxicityLabel {
        if self.class.as_deref() == Some(FLAG_CLASS) && self.confidence > threshold {
            ToxicityLabel::Toxic
        } else {
            ToxicityLabel::NotToxic
        }
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Null,
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid confidence: {text}"))),
        Raw::Null => Ok(0.0),
    }
}
