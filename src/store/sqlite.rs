//! SQLite 作业存储（sqlx，异步）
//!
//! 单表文档存储：`doc` 列保存整条 Job 的 JSON，`status` / `last_heartbeat` 冗余出来建索引，
//! `version` 列做乐观并发控制，compare-and-set 即 `UPDATE ... WHERE version = ?`。
//! 需要启用 `async-sqlite` feature。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::error::StoreError;
use crate::core::job::{Expected, Job, JobPatch, JobStatus};
use crate::store::{check_and_apply, JobStore};

/// 版本号竞争时（预期仍满足）的最大重试次数
const CAS_MAX_ROUNDS: usize = 3;

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode_job(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_job(doc: &str) -> Result<Job, StoreError> {
    let job: Job = serde_json::from_str(doc).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if let Some(cp) = &job.checkpoint {
        cp.check_version()?;
    }
    Ok(job)
}

/// SQLite 持久化的作业存储
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.init_tables().await?;
        tracing::info!(path = %db_path.as_ref().display(), "Using SQLite job store");
        Ok(store)
    }

    /// 从连接池创建（调用方负责建表）
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                doc TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_heartbeat ON jobs(status, last_heartbeat)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get_versioned(&self, id: &str) -> Result<Option<(Job, i64)>, StoreError> {
        let row = sqlx::query("SELECT doc, version FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("doc").map_err(backend)?;
                let version: i64 = row.try_get("version").map_err(backend)?;
                Ok(Some((decode_job(&doc)?, version)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let doc = encode_job(job)?;
        let result = sqlx::query(
            "INSERT INTO jobs (id, status, last_heartbeat, created_at, version, doc)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(job.last_heartbeat.timestamp_millis())
        .bind(job.created_at.timestamp_millis())
        .bind(&doc)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false) =>
            {
                let actual = self
                    .get_versioned(&job.id)
                    .await?
                    .map(|(j, _)| j.status)
                    .unwrap_or(JobStatus::Queued);
                Err(StoreError::Conflict {
                    id: job.id.clone(),
                    expected: "absent".to_string(),
                    actual,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.get_versioned(id).await?.map(|(job, _)| job))
    }

    async fn cas_update_job(
        &self,
        id: &str,
        expected: &Expected,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        for _ in 0..CAS_MAX_ROUNDS {
            let (current, version) = self
                .get_versioned(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let updated = check_and_apply(&current, expected, patch.clone())?;
            let doc = encode_job(&updated)?;

            let affected = sqlx::query(
                "UPDATE jobs SET status = ?, last_heartbeat = ?, version = version + 1, doc = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(updated.status.as_str())
            .bind(updated.last_heartbeat.timestamp_millis())
            .bind(&doc)
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(backend)?
            .rows_affected();

            if affected == 1 {
                return Ok(updated);
            }
            tracing::debug!(job_id = %id, "version race on cas update, re-reading");
        }

        // 多次版本竞争：以最新记录报告冲突
        let actual = self
            .get_versioned(id)
            .await?
            .map(|(j, _)| j.status)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Err(StoreError::Conflict {
            id: id.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }

    async fn list_stale_processing_jobs(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM jobs WHERE status = ? AND last_heartbeat < ? ORDER BY created_at ASC",
        )
        .bind(JobStatus::Processing.as_str())
        .bind(heartbeat_before.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let doc: String = row.try_get("doc").map_err(backend)?;
                decode_job(&doc)
            })
            .collect()
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?
            .rows_affected();
        Ok(affected > 0)
    }
}
