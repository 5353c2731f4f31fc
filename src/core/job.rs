//! Job 记录：状态、请求、检查点与终态结果
//!
//! 所有修改都经过 `JobStore::cas_update_job(id, Expected, JobPatch)`；
//! `JobPatch::apply` 是内存与 SQLite 两种存储共用的补丁逻辑。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::JobFailure;
use crate::store::checkpoint::CheckpointState;

/// 作业状态；Completed / Failed 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Paused => "Paused",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(JobStatus::Queued),
            "Processing" => Ok(JobStatus::Processing),
            "Paused" => Ok(JobStatus::Paused),
            "Completed" => Ok(JobStatus::Completed),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// 客户端请求：要处理的对象与任务描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub subject_id: String,
    pub input: String,
}

impl JobRequest {
    pub fn new(subject_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            input: input.into(),
        }
    }
}

/// 一个可恢复的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub request: JobRequest,
    /// 首次暂停前为 None；每次写入整体替换
    pub checkpoint: Option<CheckpointState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Reaper 强制恢复次数，只增不减
    pub retry_count: u32,
    /// 当前持有该作业的调用令牌（Processing 时有值）
    pub owner: Option<String>,
    pub result: Option<String>,
    pub error: Option<JobFailure>,
    /// 创建时同步算出的部分结果，保证慢作业不「沉默」
    pub initial_summary: String,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        request: JobRequest,
        initial_summary: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            request,
            checkpoint: None,
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            retry_count: 0,
            owner: None,
            result: None,
            error: None,
            initial_summary: initial_summary.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 展示给等待中的用户：最新检查点的部分结果，没有则用初始摘要
    pub fn progress_summary(&self) -> String {
        self.checkpoint
            .as_ref()
            .map(|cp| cp.partial_result.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.initial_summary)
            .to_string()
    }
}

/// compare-and-set 的预期：状态必须相等；若指定 owner / heartbeat，也必须相等
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub status: JobStatus,
    pub owner: Option<String>,
    /// Reaper 用：扫描后原调用写过心跳则冲突
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            owner: None,
            heartbeat: None,
        }
    }

    /// Processing 且由该调用持有
    pub fn owned(token: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Processing,
            owner: Some(token.into()),
            heartbeat: None,
        }
    }

    /// 与扫描时看到的记录完全一致（状态、持有者、心跳）
    pub fn snapshot_of(job: &Job) -> Self {
        Self {
            status: job.status,
            owner: job.owner.clone(),
            heartbeat: Some(job.last_heartbeat),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        if let Some(at) = self.heartbeat {
            if job.last_heartbeat != at || job.owner != self.owner {
                return false;
            }
        }
        match &self.owner {
            Some(token) => job.owner.as_deref() == Some(token.as_str()),
            None => true,
        }
    }
}

impl std::fmt::Display for Expected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.owner {
            Some(token) => write!(f, "{} (owner {})", self.status, token),
            None => write!(f, "{}", self.status),
        }
    }
}

/// 部分更新；None 表示不修改
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    /// Some(None) 清空持有者
    pub owner: Option<Option<String>>,
    pub checkpoint: Option<CheckpointState>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub increment_retry: bool,
    pub result: Option<String>,
    pub error: Option<JobFailure>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn checkpoint(mut self, checkpoint: CheckpointState) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    pub fn increment_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn error(mut self, error: JobFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn apply(self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(owner) = self.owner {
            job.owner = owner;
        }
        if let Some(cp) = self.checkpoint {
            job.checkpoint = Some(cp);
        }
        if let Some(at) = self.last_heartbeat {
            job.last_heartbeat = at;
        }
        if self.increment_retry {
            job.retry_count = job.retry_count.saturating_add(1);
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if let Some(at) = self.updated_at {
            job.updated_at = at;
        }
        // 终态之外不得携带 result / error；终态之后不再有持有者
        if job.status.is_terminal() {
            job.owner = None;
        } else {
            job.result = None;
            job.error = None;
        }
    }
}
