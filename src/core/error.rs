//! 引擎错误类型与终态失败原因
//!
//! 暂停（预算耗尽）与冲突（被其它调用抢先）不是错误，由 `Outcome` 表达；
//! 这里只放需要向上传播的条件：存储故障、熔断打开、重试耗尽、配置错误。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::job::JobStatus;

/// 作业存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    /// compare-and-set 失败：当前状态/持有者与预期不符
    #[error("Conflict on job {id}: expected {expected}, found {actual:?}")]
    Conflict {
        id: String,
        expected: String,
        actual: JobStatus,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// 重试调用器错误：熔断打开与普通失败必须可区分
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// 熔断器打开，未发起任何调用
    #[error("Circuit open for {key}, next probe at {retry_at}")]
    BreakerOpen { key: String, retry_at: DateTime<Utc> },

    /// 重试次数耗尽
    #[error("{key} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    /// 剩余时间不足以开始（或继续）调用
    #[error("No budget left to call {key}")]
    BudgetExhausted { key: String },
}

/// 引擎对外错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// compare-and-set 冲突：另一个调用（或 Reaper）已经推进了作业
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Conflict { .. }))
    }

    /// 将存储层 NotFound 提升为引擎层 NotFound，其余保持
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// 终态失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 推理步骤声明无法继续，或其它不可恢复错误
    Fatal,
    /// 依赖在作业剩余预算内无法恢复（熔断）
    DependencyUnavailable,
    /// 全局时间预算耗尽
    BudgetExhausted,
    /// 累计迭代达到上限
    IterationCeiling,
    /// 心跳过期且超过 Reaper 重试上限
    Stuck,
    /// 外部取消
    Cancelled,
    /// 上下文组装失败
    ContextAssembly,
}

/// 存储在 Job.error 中的失败原因；message 面向用户，不含堆栈
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 「暂时降级，稍后用新作业重试」还是「永久失败，不要重试」
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::DependencyUnavailable | FailureKind::Stuck
        )
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
