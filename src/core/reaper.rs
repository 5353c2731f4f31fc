//! Reaper：按固定间隔回收心跳过期的 Processing 作业
//!
//! 心跳过期说明上一次调用在写检查点前被杀或崩溃。retry_count 未达上限的作业回到 Paused
//! 等待续跑，否则以 Stuck 失败。与所有写入者一样走 compare-and-set：
//! 期间若原调用恰好写入了心跳或检查点，这里的写入冲突并被跳过。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::core::clock::to_chrono;
use crate::core::error::{EngineError, FailureKind, JobFailure, StoreError};
use crate::core::job::{Expected, Job, JobPatch, JobStatus};
use crate::core::state_machine::JobStateMachine;

/// 单次扫描内并发处理的作业数
const SWEEP_CONCURRENCY: usize = 8;

/// 一次扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// 回到 Paused 的作业
    pub requeued: Vec<String>,
    /// 超过重试上限而失败的作业
    pub failed: Vec<String>,
    /// compare-and-set 冲突（作业其实还活着或已被推进）
    pub skipped: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

enum Reaped {
    Requeued(String),
    Failed(String),
    Skipped(String),
}

pub struct Reaper {
    jobs: Arc<JobStateMachine>,
    stale_threshold: Duration,
    retry_ceiling: u32,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        jobs: Arc<JobStateMachine>,
        stale_threshold: Duration,
        retry_ceiling: u32,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            stale_threshold,
            retry_ceiling,
            interval,
        }
    }

    /// 扫描一次
    pub async fn sweep(&self) -> Result<ReapReport, EngineError> {
        let now = self.jobs.clock().now();
        let cutoff = now - to_chrono(self.stale_threshold);
        let stale = self
            .jobs
            .store()
            .list_stale_processing_jobs(cutoff)
            .await?;
        if stale.is_empty() {
            return Ok(ReapReport::default());
        }
        tracing::info!(count = stale.len(), "reaper found stale jobs");

        let results: Vec<Result<Reaped, EngineError>> = stream::iter(stale)
            .map(|job| self.reap_one(job))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let mut report = ReapReport::default();
        for result in results {
            match result? {
                Reaped::Requeued(id) => report.requeued.push(id),
                Reaped::Failed(id) => report.failed.push(id),
                Reaped::Skipped(id) => report.skipped.push(id),
            }
        }
        Ok(report)
    }

    async fn reap_one(&self, job: Job) -> Result<Reaped, EngineError> {
        let now = self.jobs.clock().now();
        // 以扫描时看到的记录为预期：原调用之后的任何心跳或检查点写入都会让这里冲突
        let expected = Expected::snapshot_of(&job);
        let (patch, requeue) = if job.retry_count < self.retry_ceiling {
            let patch = JobPatch::at(now)
                .status(JobStatus::Paused)
                .owner(None)
                .increment_retry();
            (patch, true)
        } else {
            let failure = JobFailure::new(
                FailureKind::Stuck,
                format!(
                    "stuck — exceeded retry ceiling ({} forced recoveries)",
                    job.retry_count
                ),
            );
            (JobPatch::at(now).status(JobStatus::Failed).error(failure), false)
        };

        let stale_ms = (now - job.last_heartbeat).num_milliseconds();
        match self.jobs.store().cas_update_job(&job.id, &expected, patch).await {
            Ok(updated) if requeue => {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    stale_ms,
                    "reaper requeued stale job"
                );
                Ok(Reaped::Requeued(job.id))
            }
            Ok(_) => {
                tracing::error!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    stale_ms,
                    "reaper failed stuck job"
                );
                Ok(Reaped::Failed(job.id))
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {
                tracing::debug!(job_id = %job.id, "reaper lost race, skipping");
                Ok(Reaped::Skipped(job.id))
            }
            Err(e) => Err(EngineError::from_store(e)),
        }
    }

    /// 后台运行直到 shutdown 被取消；单次扫描失败只记录日志
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if !report.is_empty() => {
                            tracing::info!(
                                requeued = report.requeued.len(),
                                failed = report.failed.len(),
                                skipped = report.skipped.len(),
                                "reaper sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "reaper sweep failed"),
                    }
                }
            }
        }
    }
}
