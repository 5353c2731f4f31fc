//! 时钟抽象
//!
//! 截止时间、心跳与熔断时间戳都是墙钟时间（需持久化）；测试时用 `TokioClock`
//! 让墙钟跟随 tokio 的（可暂停）时间前进，模拟工具耗时只需 `tokio::time::sleep`。

use std::time::Duration;

use chrono::{DateTime, Utc};

/// 墙钟来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 锚定在 tokio 单调时钟上的墙钟：anchor + (Instant::now() - start)
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.start);
        self.anchor + to_chrono(elapsed)
    }
}

/// std Duration -> chrono Duration（溢出时取最大值）
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// 两个时间点之差，负值截断为 0
pub fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
