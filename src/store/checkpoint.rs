//! 检查点：迭代循环的中途进度
//!
//! 对话历史只追加；每次写入整体替换上一个检查点（它已包含累计历史）。
//! 序列化为带 `version` 的 JSON，未知版本按损坏处理。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::clock::Clock;
use crate::core::error::StoreError;
use crate::core::job::{Expected, Job, JobPatch};
use crate::store::JobStore;

/// 当前检查点格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

/// 上下文组装器的产出，持久化后续跑可跳过初始化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingContext {
    /// 可直接展示给用户的摘要
    pub summary: String,
    #[serde(default)]
    pub data: Value,
}

impl WorkingContext {
    pub fn new(summary: impl Into<String>, data: Value) -> Self {
        Self {
            summary: summary.into(),
            data,
        }
    }
}

/// 工具错误类别：熔断打开要与普通失败区分，交给推理步骤决定是否跳过该工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    BreakerOpen,
    Failed,
}

/// 对话历史中的一轮
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    Reasoning {
        iteration: u32,
        text: String,
    },
    ToolCall {
        iteration: u32,
        tool: String,
        params: Value,
    },
    ToolResult {
        iteration: u32,
        tool: String,
        output: String,
    },
    ToolError {
        iteration: u32,
        tool: String,
        error: ToolErrorKind,
        message: String,
    },
}

impl Turn {
    pub fn iteration(&self) -> u32 {
        match self {
            Turn::Reasoning { iteration, .. }
            | Turn::ToolCall { iteration, .. }
            | Turn::ToolResult { iteration, .. }
            | Turn::ToolError { iteration, .. } => *iteration,
        }
    }
}

/// 只追加的有序历史；没有删除或原地修改的接口
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(Vec<Turn>);

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一轮并返回新的历史
    #[must_use]
    pub fn with(mut self, turn: Turn) -> Self {
        self.0.push(turn);
        self
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.0.last()
    }
}

/// 迭代循环的序列化进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub conversation_history: History,
    /// 已完成的 reason→act→observe 轮数（跨调用累计）
    pub iteration_index: u32,
    pub initialization_complete: bool,
    /// 跨所有调用累计的墙钟耗时
    pub elapsed_ms: u64,
    /// 等待中可展示给用户的进度
    pub partial_result: String,
    #[serde(default)]
    pub context: Option<WorkingContext>,
    /// 连续没有推进（迭代未增加、初始化未完成）就暂停的调用次数
    #[serde(default)]
    pub stalled_invocations: u32,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            conversation_history: History::new(),
            iteration_index: 0,
            initialization_complete: false,
            elapsed_ms: 0,
            partial_result: String::new(),
            context: None,
            stalled_invocations: 0,
        }
    }
}

impl CheckpointState {
    pub fn check_version(&self) -> Result<(), StoreError> {
        if self.version == CHECKPOINT_VERSION {
            Ok(())
        } else {
            Err(StoreError::Corrupt(format!(
                "unsupported checkpoint version {}",
                self.version
            )))
        }
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        let cp: CheckpointState =
            serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        cp.check_version()?;
        Ok(cp)
    }
}

/// 检查点读写：按 job id 寻址，写入是持有者校验的单文档原子更新
pub struct CheckpointStore {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<CheckpointState>, StoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        match job.checkpoint {
            Some(cp) => {
                cp.check_version()?;
                Ok(Some(cp))
            }
            None => Ok(None),
        }
    }

    /// 提交点：写入成功即代表该进度不会丢失；同时刷新心跳
    pub async fn save(
        &self,
        job_id: &str,
        token: &str,
        checkpoint: &CheckpointState,
    ) -> Result<Job, StoreError> {
        let now = self.clock.now();
        self.store
            .cas_update_job(
                job_id,
                &Expected::owned(token),
                JobPatch::at(now).checkpoint(checkpoint.clone()).heartbeat(now),
            )
            .await
    }
}
