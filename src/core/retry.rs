use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::data::Common;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 抖动因子，避免所有任务同时重试
    /// 后端没有标记为可重试的错误，消息中包含这些关键字时仍然重试
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% 的抖动
            retryable_errors: vec![
                "network error".to_string(),
                "timeout".to_string(),
                "connection reset".to_string(),
                "temporary failure".to_string(),
                "connection refused".to_string(),
                "service unavailable".to_string(),
                "gateway timeout".to_string(),
                "网络错误".to_string(),
                "超时".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    /// 节点自己的 retry_limit / retry_delay（秒）优先于全局设置
    pub fn for_node(&self, common: Option<&Common>) -> RetryPolicy {
        let mut policy = self.clone();
        if let Some(common) = common {
            if common.retry_limit > 0 {
                policy.max_retries = common.retry_limit;
            }
            if common.retry_delay > 0 {
                policy.base_delay = Duration::from_secs(common.retry_delay as u64);
            }
        }
        policy
    }

    pub fn is_retryable_message(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.retryable_errors.iter().any(|keyword| message.contains(keyword.as_str()))
    }

    pub fn should_retry(&self, retryable: bool, retry_count: u32) -> bool {
        retryable && retry_count < self.max_retries
    }

    pub fn get_delay(&self, retry_count: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let delay_secs = self.base_delay.as_secs_f64() *
            self.backoff_multiplier.powi(retry_count as i32);

        // 添加抖动避免重试风暴
        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (delay_secs + jitter).max(0.1); // 最小延迟100ms

        if !final_delay.is_finite() || final_delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(final_delay)
    }
}
