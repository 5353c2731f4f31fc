//! Job 状态机：创建、状态迁移、心跳、完成与失败
//!
//! 所有写入都是 `JobStore::cas_update_job`，这是唯一的同步手段（无锁、无选主）。
//! 调用令牌（owner）区分「同一调用重入 Processing」与「另一个调用并发驱动」。

use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::error::{EngineError, JobFailure, StoreError};
use crate::core::job::{Expected, Job, JobPatch, JobRequest, JobStatus};
use crate::store::{CheckpointState, JobStore};

/// 终态写入时因并发重读的次数上限
const FINISH_MAX_ROUNDS: usize = 4;

pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 新建作业：Queued，无检查点，带初始摘要
    pub async fn create(
        &self,
        request: JobRequest,
        initial_summary: impl Into<String>,
    ) -> Result<Job, EngineError> {
        let id = format!("job_{}", uuid::Uuid::new_v4());
        let job = Job::new(id, request, initial_summary, self.clock.now());
        self.store.insert_job(&job).await?;
        tracing::info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// 只读获取
    pub async fn get(&self, id: &str) -> Result<Job, EngineError> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// 续跑前加载；终态作业由调用方直接返回已存结果，不再进入循环
    pub async fn load_for_resume(&self, id: &str) -> Result<Job, EngineError> {
        self.get(id).await
    }

    /// 仅比较状态的迁移；当前状态不是 from 时返回 Conflict
    pub async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Job, EngineError> {
        let patch = JobPatch::at(self.clock.now()).status(to);
        let job = self
            .store
            .cas_update_job(id, &Expected::status(from), patch)
            .await
            .map_err(EngineError::from_store)?;
        tracing::debug!(job_id = %id, %from, %to, "job transition");
        Ok(job)
    }

    /// 以调用令牌占有作业：Queued/Paused → Processing；同一令牌的 Processing 重入也允许
    pub async fn claim(&self, id: &str, token: &str) -> Result<Job, EngineError> {
        let current = self.get(id).await?;
        let now = self.clock.now();
        let expected = match current.status {
            JobStatus::Queued | JobStatus::Paused => Expected::status(current.status),
            JobStatus::Processing if current.owner.as_deref() == Some(token) => {
                Expected::owned(token)
            }
            other => {
                return Err(EngineError::Store(StoreError::Conflict {
                    id: id.to_string(),
                    expected: "Queued or Paused".to_string(),
                    actual: other,
                }))
            }
        };
        let patch = JobPatch::at(now)
            .status(JobStatus::Processing)
            .owner(Some(token.to_string()))
            .heartbeat(now);
        let job = self
            .store
            .cas_update_job(id, &expected, patch)
            .await
            .map_err(EngineError::from_store)?;
        tracing::info!(job_id = %id, from = %current.status, "job claimed");
        Ok(job)
    }

    /// 刷新心跳，让 Reaper 区分「慢但活着」与「已死」
    pub async fn mark_heartbeat(&self, id: &str, token: &str) -> Result<Job, EngineError> {
        let now = self.clock.now();
        self.store
            .cas_update_job(id, &Expected::owned(token), JobPatch::at(now).heartbeat(now))
            .await
            .map_err(EngineError::from_store)
    }

    /// 写入检查点并 Processing → Paused，释放占有
    pub async fn pause(
        &self,
        id: &str,
        token: &str,
        checkpoint: CheckpointState,
    ) -> Result<Job, EngineError> {
        let now = self.clock.now();
        let iteration = checkpoint.iteration_index;
        let patch = JobPatch::at(now)
            .status(JobStatus::Paused)
            .owner(None)
            .checkpoint(checkpoint)
            .heartbeat(now);
        let job = self
            .store
            .cas_update_job(id, &Expected::owned(token), patch)
            .await
            .map_err(EngineError::from_store)?;
        tracing::info!(job_id = %id, iteration, "job paused");
        Ok(job)
    }

    /// 完成；对已终态的作业是无操作，返回已存记录
    pub async fn complete(&self, id: &str, result: impl Into<String>) -> Result<Job, EngineError> {
        let result = result.into();
        self.finish(id, None, |patch| {
            patch.status(JobStatus::Completed).result(result.clone())
        })
        .await
    }

    /// 失败；对已终态的作业是无操作，返回已存记录
    pub async fn fail(&self, id: &str, failure: JobFailure) -> Result<Job, EngineError> {
        self.finish(id, None, |patch| {
            patch.status(JobStatus::Failed).error(failure.clone())
        })
        .await
    }

    /// 循环内完成：必须仍由该令牌占有
    pub(crate) async fn complete_owned(
        &self,
        id: &str,
        token: &str,
        result: &str,
        checkpoint: CheckpointState,
    ) -> Result<Job, EngineError> {
        self.finish(id, Some(token), |patch| {
            patch
                .status(JobStatus::Completed)
                .result(result)
                .checkpoint(checkpoint.clone())
        })
        .await
    }

    /// 循环内失败：必须仍由该令牌占有
    pub(crate) async fn fail_owned(
        &self,
        id: &str,
        token: &str,
        failure: JobFailure,
        checkpoint: Option<CheckpointState>,
    ) -> Result<Job, EngineError> {
        self.finish(id, Some(token), |patch| {
            let patch = patch.status(JobStatus::Failed).error(failure.clone());
            match &checkpoint {
                Some(cp) => patch.checkpoint(cp.clone()),
                None => patch,
            }
        })
        .await
    }

    /// 终态写入（同时释放占有）：已终态则无操作；owner 为 Some 时要求仍由其占有，否则按当前状态比较
    async fn finish<F>(&self, id: &str, owner: Option<&str>, build: F) -> Result<Job, EngineError>
    where
        F: Fn(JobPatch) -> JobPatch,
    {
        for _ in 0..FINISH_MAX_ROUNDS {
            let current = self.get(id).await?;
            if current.is_terminal() {
                tracing::debug!(job_id = %id, status = %current.status, "already terminal, no-op");
                return Ok(current);
            }
            let expected = match owner {
                Some(token) => Expected::owned(token),
                None => Expected::status(current.status),
            };
            let patch = build(JobPatch::at(self.clock.now())).owner(None);
            match self.store.cas_update_job(id, &expected, patch).await {
                Ok(job) => {
                    tracing::info!(job_id = %id, status = %job.status, "job finished");
                    return Ok(job);
                }
                Err(StoreError::Conflict { .. }) if owner.is_none() => continue,
                Err(StoreError::Conflict { .. }) => {
                    // 可能是 Reaper / 取消抢先写了终态
                    let latest = self.get(id).await?;
                    if latest.is_terminal() {
                        return Ok(latest);
                    }
                    return Err(EngineError::Store(StoreError::Conflict {
                        id: id.to_string(),
                        expected: expected.to_string(),
                        actual: latest.status,
                    }));
                }
                Err(e) => return Err(EngineError::from_store(e)),
            }
        }
        let latest = self.get(id).await?;
        Err(EngineError::Store(StoreError::Conflict {
            id: id.to_string(),
            expected: "non-terminal".to_string(),
            actual: latest.status,
        }))
    }
}
