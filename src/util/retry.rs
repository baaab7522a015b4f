//! 指数バックオフ付き再試行ロジック。
//!
//! HTTP 呼び出しからは独立しており、[`Sleeper`] を差し替えることで
//! 実時間を待たずにテストできる。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間
    pub base_delay: Duration,
    /// 最大遅延時間
    pub max_delay: Duration,
    /// Full Jitter を適用するかどうか
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `failures` 回失敗した後に待つべき時間を返す。
    ///
    /// `base * 2^(failures-1)` を `max_delay` でキャップする。
    /// jitter 有効時は `0..=capped` の一様乱数になる。
    #[must_use]
    pub fn delay_for_attempt(&self, failures: usize) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(failures - 1).unwrap_or(u32::MAX);
        let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .saturating_mul(factor)
            .min(self.max_delay);

        if !self.jitter || capped.is_zero() {
            return capped;
        }

        let capped_ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=capped_ms))
    }

    /// `failures` 回失敗した時点でまだ試行できるかどうか。
    #[must_use]
    pub const fn can_retry(&self, failures: usize) -> bool {
        failures < self.max_attempts
    }
}

/// バックオフ待機の抽象。
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// `tokio::time::sleep` による実時間の待機。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// すべての試行が失敗したことを表す。
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

/// `operation` を `policy` に従って再試行する。
///
/// `operation` には 1 始まりの試行番号が渡される。
///
/// # Errors
/// 最大試行回数まで失敗し続けた場合、最後のエラーを [`Exhausted`] に包んで返す。
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures = 0;

    loop {
        let attempt = failures + 1;
        match operation(attempt).await {
            Ok(value) => {
                if failures > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                failures += 1;

                if !policy.can_retry(failures) {
                    warn!(
                        attempts = failures,
                        max_attempts = policy.max_attempts,
                        error = %error,
                        "operation failed after all retries"
                    );
                    return Err(Exhausted {
                        attempts: failures,
                        last_error: error,
                    });
                }

                let delay = policy.delay_for_attempt(failures);
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "operation failed, retrying after delay"
                );
                sleeper.sleep(delay).await;
            }
        }
    }
}
