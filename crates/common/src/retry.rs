//! 通用退避模块
//!
//! 瞬时错误后的重新轮询、消费组会话失败后的重新加入，都按指数退避等待

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 指数退避策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// 初始延迟
    pub initial_delay: Duration,
    /// 最大延迟
    pub max_delay: Duration,
    /// 退避乘数
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// 不等待，立即重试
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// 设置退避乘数
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// 计算第 n 次（从 0 开始）重试的延迟
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = if delay_ms.is_finite() {
            (delay_ms as u64).min(self.max_delay.as_millis() as u64)
        } else {
            self.max_delay.as_millis() as u64
        };
        Duration::from_millis(capped)
    }
}

/// 可取消的等待
///
/// 等满 `delay` 返回 true；期间 token 被取消返回 false
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(delay_ms = delay.as_millis() as u64, "Backoff interrupted by cancellation");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
