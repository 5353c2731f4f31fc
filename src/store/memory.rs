//! 内存作业存储（RwLock<HashMap>），写锁内完成比较与更新

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::error::StoreError;
use crate::core::job::{Expected, Job, JobPatch, JobStatus};
use crate::store::{check_and_apply, JobStore};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.id) {
            return Err(StoreError::Conflict {
                id: job.id.clone(),
                expected: "absent".to_string(),
                actual: existing.status,
            });
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn cas_update_job(
        &self,
        id: &str,
        expected: &Expected,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let updated = check_and_apply(current, expected, patch)?;
        jobs.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn list_stale_processing_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.last_heartbeat < heartbeat_before)
            .cloned()
            .collect();
        // 先见先处理
        stale.sort_by_key(|j| j.created_at);
        Ok(stale)
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }
}
