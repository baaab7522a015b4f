//! ModerateHateSpeech API クライアント。
//!
//! 1 回の試行ごとにタイムアウトを適用し、失敗は [`RetryPolicy`] に従って
//! 再試行する。再試行を使い切った場合はエラーではなく `Verdict::Indeterminate` を返す。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::response::ModerationResponse;
use super::{Classifier, Verdict};
use crate::util::retry::{RetryPolicy, Sleeper, TokioSleeper, retry_with_backoff};

pub const DEFAULT_ENDPOINT: &str = "https://api.moderatehatespeech.com/api/v1/moderate/";

/// 1 回の試行の失敗。いずれも再試行対象。
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("moderation endpoint returned error status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode moderation response: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Clone)]
pub struct ModerationConfig {
    pub endpoint: String,
    pub token: String,
    pub timeout: Duration,
    pub threshold: f64,
    pub retry: RetryPolicy,
}

impl fmt::Debug for ModerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModerationConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("threshold", &self.threshold)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    token: &'a str,
    text: &'a str,
}

#[derive(Clone)]
pub struct ModerationClient {
    client: Client,
    endpoint: Url,
    token: String,
    threshold: f64,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ModerationClient {
    /// # Errors
    /// エンドポイント URL が不正な場合、または HTTP クライアントの構築に失敗した場合。
    pub fn new(config: ModerationConfig) -> Result<Self> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    /// バックオフの待機方法を差し替えて構築する。
    ///
    /// # Errors
    /// [`ModerationClient::new`] と同じ。
    pub fn with_sleeper(config: ModerationConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build moderation HTTP client")?;
        let endpoint = Url::parse(&config.endpoint).context("invalid moderation endpoint URL")?;

        Ok(Self {
            client,
            endpoint,
            token: config.token,
            threshold: config.threshold,
            retry: config.retry,
            sleeper,
        })
    }

    async fn moderate_once(&self, text: &str) -> Result<ModerationResponse, ModerationError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ModerationRequest {
                token: &self.token,
                text,
            })
            .send()
            .await
            .map_err(ModerationError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Status {
                status,
                body: truncate(&body, 256),
            });
        }

        response
            .json::<ModerationResponse>()
            .await
            .map_err(ModerationError::Decode)
    }
}

#[async_trait]
impl Classifier for ModerationClient {
    async fn classify(&self, text: &str) -> Verdict {
        let outcome = retry_with_backoff(&self.retry, self.sleeper.as_ref(), move |attempt| {
            debug!(attempt, chars = text.chars().count(), "sending moderation request");
            self.moderate_once(text)
        })
        .await;

        match outcome {
            Ok(response) => Verdict::Label(response.decide(self.threshold)),
            Err(exhausted) => {
                warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "moderation retries exhausted, leaving record indeterminate"
                );
                Verdict::Indeterminate
            }
        }
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}
