//! 时间预算分配
//!
//! 每次调用开始时根据硬截止时间 D 与累计耗时计算：
//! - invocation = D - now - safety_margin（若配置了全局预算，再与 global - elapsed 取小）
//! - initialization = invocation × ratio（仅当初始化尚未完成）
//!
//! 循环在每个工作单元开始前调用 `can_start_unit`，从不在单元中途检查。

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::clock::{to_chrono, until};

/// 分配策略（来自 [engine] 配置）
#[derive(Debug, Clone)]
pub struct BudgetPolicy {
    pub initialization_ratio: f64,
    pub safety_margin: Duration,
    /// 跨所有调用的总耗时上限
    pub job_time_budget: Option<Duration>,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            initialization_ratio: 0.6,
            safety_margin: Duration::from_secs(3),
            job_time_budget: None,
        }
    }
}

impl BudgetPolicy {
    pub fn allocate(
        &self,
        hard_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        elapsed_ms: u64,
        initialization_complete: bool,
    ) -> InvocationBudget {
        let mut invocation = until(now, hard_deadline).saturating_sub(self.safety_margin);

        let global_remaining = self
            .job_time_budget
            .map(|total| total.saturating_sub(Duration::from_millis(elapsed_ms)));
        if let Some(left) = global_remaining {
            invocation = invocation.min(left);
        }

        let initialization = if initialization_complete {
            Duration::ZERO
        } else {
            let ratio = if self.initialization_ratio.is_finite() {
                self.initialization_ratio.clamp(0.0, 1.0)
            } else {
                0.0
            };
            invocation.mul_f64(ratio)
        };

        InvocationBudget {
            started_at: now,
            stop_at: now + to_chrono(invocation),
            init_stop_at: now + to_chrono(initialization),
            invocation,
            initialization,
            global_end: global_remaining.map(|left| now + to_chrono(left)),
            global_exhausted: global_remaining == Some(Duration::ZERO),
        }
    }
}

/// 一次调用的预算
#[derive(Debug, Clone)]
pub struct InvocationBudget {
    started_at: DateTime<Utc>,
    stop_at: DateTime<Utc>,
    init_stop_at: DateTime<Utc>,
    invocation: Duration,
    initialization: Duration,
    global_end: Option<DateTime<Utc>>,
    global_exhausted: bool,
}

impl InvocationBudget {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 本次调用必须停下并写检查点的时刻
    pub fn stop_at(&self) -> DateTime<Utc> {
        self.stop_at
    }

    pub fn invocation_budget(&self) -> Duration {
        self.invocation
    }

    pub fn initialization_budget(&self) -> Duration {
        self.initialization
    }

    /// 全局预算用尽的时刻（未配置全局预算时为 None）
    pub fn global_end(&self) -> Option<DateTime<Utc>> {
        self.global_end
    }

    pub fn global_exhausted(&self) -> bool {
        self.global_exhausted
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        until(now, self.stop_at)
    }

    pub fn init_remaining(&self, now: DateTime<Utc>) -> Duration {
        until(now, self.init_stop_at)
    }

    /// 剩余时间是否足够开始一个预计耗时 estimate 的单元
    pub fn can_start_unit(&self, now: DateTime<Utc>, estimate: Duration) -> bool {
        let remaining = self.remaining(now);
        !remaining.is_zero() && remaining > estimate
    }

    /// 本次调用已用时间
    pub fn spent(&self, now: DateTime<Utc>) -> Duration {
        until(self.started_at, now)
    }
}
