//! 重试调用器
//!
//! 每次调用：先问熔断器 → Open 则快速失败（BreakerOpen，不发起调用）→
//! 否则带单次超时尝试，失败后指数退避（带抖动）重试，直到次数上限；
//! 最终失败才向熔断器报告一次失败。每次调用输出一条 JSON 审计日志。
//!
//! 预算约束：单次超时截到剩余时间，调用不会越过截止时间；剩余时间低于 `min_attempt` 时不开始尝试。
//! 被预算截断的尝试返回 BudgetExhausted，不计为依赖失败。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::timeout;

use crate::core::clock::{until, Clock};
use crate::core::error::InvokeError;
use crate::tools::breaker::{Admission, BreakerRegistry};

/// 重试参数（来自 [tools] 配置）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub per_attempt_timeout: Duration,
    /// 开始一次尝试所需的最少剩余时间
    pub min_attempt: Duration,
    /// 首次之外的重试次数
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_secs(10),
            min_attempt: Duration::from_secs(1),
            max_retries: 2,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待：base × 2^(attempt-1)，封顶后取 [50%, 100%] 的随机抖动
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let capped = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(factor)
    }
}

/// 包装外部依赖调用：熔断 + 超时 + 重试
pub struct RetryingInvoker {
    breakers: Arc<BreakerRegistry>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryingInvoker {
    pub fn new(breakers: Arc<BreakerRegistry>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers,
            policy,
            clock,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 在 deadline 之前调用 op；key 为熔断器依赖名
    pub async fn call<T, F, Fut>(
        &self,
        key: &str,
        deadline: DateTime<Utc>,
        mut op: F,
    ) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let probe = match self.breakers.admit(key) {
            Admission::Allowed => false,
            Admission::Probe => true,
            Admission::Rejected { retry_at } => {
                tracing::debug!(key = %key, %retry_at, "circuit open, failing fast");
                audit(key, "breaker_open", 0, Duration::ZERO);
                return Err(InvokeError::BreakerOpen {
                    key: key.to_string(),
                    retry_at,
                });
            }
        };
        let max_attempts = if probe { 1 } else { self.policy.max_retries + 1 };

        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_error = String::new();
        loop {
            let remaining = until(self.clock.now(), deadline);
            if remaining.is_zero() || remaining < self.policy.min_attempt {
                if attempts == 0 {
                    if probe {
                        self.breakers.release_probe(key);
                    }
                    audit(key, "no_budget", 0, start.elapsed());
                    return Err(InvokeError::BudgetExhausted {
                        key: key.to_string(),
                    });
                }
                break;
            }
            let attempt_timeout = self.policy.per_attempt_timeout.min(remaining);

            attempts += 1;
            match timeout(attempt_timeout, op()).await {
                Ok(Ok(value)) => {
                    self.breakers.record_success(key);
                    audit(key, "ok", attempts, start.elapsed());
                    return Ok(value);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) if attempt_timeout < self.policy.per_attempt_timeout => {
                    tracing::debug!(
                        key = %key,
                        attempt = attempts,
                        cut_ms = attempt_timeout.as_millis() as u64,
                        "attempt cut off by invocation budget"
                    );
                    if attempts > 1 {
                        break;
                    }
                    if probe {
                        self.breakers.release_probe(key);
                    }
                    audit(key, "budget_cut", attempts, start.elapsed());
                    return Err(InvokeError::BudgetExhausted {
                        key: key.to_string(),
                    });
                }
                Err(_) => {
                    last_error = format!(
                        "timed out after {}ms",
                        self.policy.per_attempt_timeout.as_millis()
                    )
                }
            }
            tracing::debug!(key = %key, attempt = attempts, error = %last_error, "attempt failed");

            if attempts >= max_attempts {
                break;
            }
            let delay = self.policy.backoff(attempts);
            if until(self.clock.now(), deadline) < delay + self.policy.min_attempt {
                break;
            }
            tokio::time::sleep(delay).await;
        }

        self.breakers.record_failure(key);
        audit(key, "error", attempts, start.elapsed());
        Err(InvokeError::Exhausted {
            key: key.to_string(),
            attempts,
            last_error,
        })
    }
}

fn audit(key: &str, outcome: &str, attempts: u32, elapsed: Duration) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "key": key,
        "ok": outcome == "ok",
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": elapsed.as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "invoke");
}
