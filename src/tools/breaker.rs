//! 熔断器：按依赖 key 统计连续失败
//!
//! Closed →(失败 ≥ 阈值)→ Open →(open 时长已过)→ Degraded（只放行一次探测）
//! →(探测成功)→ Closed / →(探测失败)→ Open（重置 opened_at）。
//! Open → Degraded 的转换是惰性的，在 `admit` 时检查。
//! 状态是进程内的，由 `BreakerRegistry` 显式持有并传给 `RetryingInvoker`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::clock::{to_chrono, Clock};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    /// 半开：允许一次探测
    Degraded,
}

/// 单个依赖的熔断记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Degraded 下探测是否已放行
    #[serde(skip)]
    probe_in_flight: bool,
}

impl CircuitBreakerState {
    fn closed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// 熔断参数（来自 [breaker] 配置）
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_for: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_for: Duration::from_secs(30),
        }
    }
}

/// `admit` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Degraded 下的唯一探测
    Probe,
    Rejected { retry_at: DateTime<Utc> },
}

/// 按依赖名索引的熔断器集合
pub struct BreakerRegistry {
    policy: BreakerPolicy,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl BreakerRegistry {
    pub fn new(policy: BreakerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reopen_at(&self, opened_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        opened_at.unwrap_or_else(|| self.clock.now()) + to_chrono(self.policy.open_for)
    }

    /// 调用前询问是否放行
    pub fn admit(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let mut states = self.lock();
        let entry = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));
        match entry.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let retry_at = self.reopen_at(entry.opened_at);
                if now >= retry_at {
                    entry.state = BreakerState::Degraded;
                    entry.probe_in_flight = true;
                    tracing::info!(key = %key, "circuit degraded, allowing one probe");
                    Admission::Probe
                } else {
                    Admission::Rejected { retry_at }
                }
            }
            BreakerState::Degraded => {
                if entry.probe_in_flight {
                    Admission::Rejected { retry_at: now }
                } else {
                    entry.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// 放行的探测最终没有发出（例如预算不足），允许下一次调用重新探测
    pub fn release_probe(&self, key: &str) {
        if let Some(entry) = self.lock().get_mut(key) {
            if entry.state == BreakerState::Degraded {
                entry.probe_in_flight = false;
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut states = self.lock();
        let entry = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));
        if entry.state != BreakerState::Closed {
            tracing::info!(key = %key, "circuit closed");
        }
        *entry = CircuitBreakerState::closed(key);
    }

    pub fn record_failure(&self, key: &str) {
        let now = self.clock.now();
        let mut states = self.lock();
        let entry = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        match entry.state {
            BreakerState::Closed => {
                if entry.consecutive_failures >= self.policy.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                    tracing::warn!(
                        key = %key,
                        failures = entry.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::Degraded => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
                entry.probe_in_flight = false;
                tracing::warn!(key = %key, "probe failed, circuit re-opened");
            }
            BreakerState::Open => {}
        }
    }

    /// 若该依赖处于 Open，返回下次允许探测的时刻
    pub fn next_probe_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let states = self.lock();
        let entry = states.get(key)?;
        (entry.state == BreakerState::Open).then(|| self.reopen_at(entry.opened_at))
    }

    pub fn snapshot(&self, key: &str) -> CircuitBreakerState {
        self.lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerState::closed(key))
    }
}
