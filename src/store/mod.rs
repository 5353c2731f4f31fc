//! 作业存储：按 id 寻址的文档存储，唯一硬性要求是 compare-and-set 更新
//!
//! - `InMemoryJobStore`：进程内（测试与单进程部署）
//! - `SqliteJobStore`：SQLite 持久化（需启用 `async-sqlite` feature）
//! - `checkpoint`：检查点结构与编解码

pub mod checkpoint;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::error::StoreError;
use crate::core::job::{Expected, Job, JobPatch};

pub use checkpoint::{
    CheckpointState, CheckpointStore, History, ToolErrorKind, Turn, WorkingContext,
};
pub use memory::InMemoryJobStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteJobStore;

/// 作业存储 trait
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 插入新作业；id 已存在时返回 Conflict
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// 原子比较并更新：当前记录满足 expected 时应用 patch 并返回新记录，否则 Conflict
    async fn cas_update_job(
        &self,
        id: &str,
        expected: &Expected,
        patch: JobPatch,
    ) -> Result<Job, StoreError>;

    /// status = Processing 且 last_heartbeat 早于 heartbeat_before 的作业
    async fn list_stale_processing_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// 删除作业（检查点随之删除）；返回是否存在
    async fn delete_job(&self, id: &str) -> Result<bool, StoreError>;
}

/// 校验预期并应用补丁（各存储实现共用）
pub(crate) fn check_and_apply(
    job: &Job,
    expected: &Expected,
    patch: JobPatch,
) -> Result<Job, StoreError> {
    if !expected.matches(job) {
        return Err(StoreError::Conflict {
            id: job.id.clone(),
            expected: expected.to_string(),
            actual: job.status,
        });
    }
    let mut updated = job.clone();
    patch.apply(&mut updated);
    Ok(updated)
}
