//! Resume Orchestrator：对外入口
//!
//! `start_or_resume` 加载或创建作业 → 终态直接返回已存结果 → 以新调用令牌占有 →
//! 启动后台心跳 → 交给迭代循环 → 把结局编码为 `Outcome`。
//! 暂停与冲突都不是错误：冲突时返回作业当前已存的状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::budget::BudgetPolicy;
use crate::core::error::{EngineError, FailureKind, JobFailure};
use crate::core::job::{Job, JobRequest, JobStatus};
use crate::core::reaper::Reaper;
use crate::core::state_machine::JobStateMachine;
use crate::react::{run_session, ContextAssembler, ReactEvent, ReactSession, Reasoner, SessionOutcome};
use crate::store::CheckpointStore;
use crate::tools::{RetryingInvoker, ToolRegistry};

/// 调用方看到的结果；paused 不是错误，调用方应携带 job_id 再次调用
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed {
        job_id: String,
        result: String,
    },
    Failed {
        job_id: String,
        error: JobFailure,
    },
    Paused {
        job_id: String,
        progress_summary: String,
    },
}

impl Outcome {
    /// 按作业当前已存状态编码
    pub fn from_job(job: &Job) -> Self {
        match job.status {
            JobStatus::Completed => Outcome::Completed {
                job_id: job.id.clone(),
                result: job.result.clone().unwrap_or_default(),
            },
            JobStatus::Failed => Outcome::Failed {
                job_id: job.id.clone(),
                error: job
                    .error
                    .clone()
                    .unwrap_or_else(|| JobFailure::new(FailureKind::Fatal, "Job failed")),
            },
            _ => Outcome::Paused {
                job_id: job.id.clone(),
                progress_summary: job.progress_summary(),
            },
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Outcome::Completed { job_id, .. }
            | Outcome::Failed { job_id, .. }
            | Outcome::Paused { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Paused { .. })
    }
}

/// Reaper 调参（来自 [reaper] 配置）
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub stale_threshold: Duration,
    pub retry_ceiling: u32,
    pub interval: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(30),
            retry_ceiling: 3,
            interval: Duration::from_secs(10),
        }
    }
}

pub struct ResumeOrchestrator {
    pub(crate) jobs: Arc<JobStateMachine>,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) invoker: RetryingInvoker,
    pub(crate) tools: ToolRegistry,
    pub(crate) reasoner: Arc<dyn Reasoner>,
    pub(crate) assembler: Arc<dyn ContextAssembler>,
    pub(crate) policy: BudgetPolicy,
    pub(crate) max_iterations: u32,
    pub(crate) max_stalled_invocations: u32,
    /// 0 表示不启动后台心跳
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reaper: ReaperSettings,
    pub(crate) event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl ResumeOrchestrator {
    pub fn jobs(&self) -> &Arc<JobStateMachine> {
        &self.jobs
    }

    pub fn invoker(&self) -> &RetryingInvoker {
        &self.invoker
    }

    /// 与本编排器共享存储的 Reaper，由调用方决定何时 `run`
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.jobs.clone(),
            self.reaper.stale_threshold,
            self.reaper.retry_ceiling,
            self.reaper.interval,
        )
    }

    /// 新建作业并驱动
    pub async fn start(
        &self,
        request: JobRequest,
        hard_deadline: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        self.start_or_resume(None, Some(request), hard_deadline).await
    }

    /// 续跑已有作业
    pub async fn resume(
        &self,
        job_id: &str,
        hard_deadline: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        self.start_or_resume(Some(job_id), None, hard_deadline).await
    }

    /// 有 job_id 时续跑（忽略 request），否则以 request 新建
    pub async fn start_or_resume(
        &self,
        job_id: Option<&str>,
        request: Option<JobRequest>,
        hard_deadline: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        let job = match job_id {
            Some(id) => self.jobs.load_for_resume(id).await?,
            None => {
                let request = request.ok_or_else(|| {
                    EngineError::InvalidRequest("either a job id or a request is required".into())
                })?;
                if request.subject_id.trim().is_empty() {
                    return Err(EngineError::InvalidRequest("subject_id is empty".into()));
                }
                let summary = self.assembler.initial_summary(&request);
                self.jobs.create(request, summary).await?
            }
        };
        if job.is_terminal() {
            tracing::debug!(job_id = %job.id, status = %job.status, "nothing to resume");
            return Ok(Outcome::from_job(&job));
        }

        let token = format!("inv_{}", uuid::Uuid::new_v4());
        let job = match self.jobs.claim(&job.id, &token).await {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                tracing::info!(job_id = %job.id, "job is driven by another invocation");
                return self.current_outcome(&job.id).await;
            }
            Err(e) => return Err(e),
        };
        let job_id = job.id.clone();

        let cancel = CancellationToken::new();
        let ticker = self.spawn_heartbeat(&job_id, &token, cancel.clone());
        let session = ReactSession {
            jobs: &self.jobs,
            checkpoints: &self.checkpoints,
            invoker: &self.invoker,
            tools: &self.tools,
            reasoner: self.reasoner.as_ref(),
            assembler: self.assembler.as_ref(),
            policy: &self.policy,
            max_iterations: self.max_iterations,
            max_stalled_invocations: self.max_stalled_invocations,
            cancel_token: cancel.clone(),
            event_tx: self.event_tx.as_ref(),
        };
        let result = run_session(&session, job, &token, hard_deadline).await;
        cancel.cancel();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }

        match result? {
            SessionOutcome::Completed(job)
            | SessionOutcome::Failed(job)
            | SessionOutcome::Paused(job) => Ok(Outcome::from_job(&job)),
            SessionOutcome::Superseded => self.current_outcome(&job_id).await,
        }
    }

    /// 只读查询，不驱动循环
    pub async fn get_status(&self, job_id: &str) -> Result<Job, EngineError> {
        self.jobs.get(job_id).await
    }

    /// 外部取消：走与完成相同的 compare-and-set 路径；已终态则返回已存结果
    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<Outcome, EngineError> {
        let failure = JobFailure::new(FailureKind::Cancelled, format!("Cancelled: {reason}"));
        let job = self.jobs.fail(job_id, failure).await?;
        tracing::info!(job_id = %job_id, status = %job.status, "cancel requested");
        Ok(Outcome::from_job(&job))
    }

    async fn current_outcome(&self, job_id: &str) -> Result<Outcome, EngineError> {
        Ok(Outcome::from_job(&self.jobs.get(job_id).await?))
    }

    /// 后台心跳：compare-and-set 失败说明作业已被接手，取消会话
    fn spawn_heartbeat(
        &self,
        job_id: &str,
        token: &str,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.heartbeat_interval.is_zero() {
            return None;
        }
        let jobs = self.jobs.clone();
        let job_id = job_id.to_string();
        let token = token.to_string();
        let period = self.heartbeat_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match jobs.mark_heartbeat(&job_id, &token).await {
                            Ok(_) => tracing::trace!(job_id = %job_id, "heartbeat"),
                            Err(e) if e.is_conflict() || matches!(e, EngineError::NotFound(_)) => {
                                tracing::info!(job_id = %job_id, "heartbeat lost ownership, stopping session");
                                cancel.cancel();
                                return;
                            }
                            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        }))
    }
}
