//! 上下文组装：初始化阶段，把请求对象的资料整理成工作上下文
//!
//! 组装可能很慢（冷数据源）；它在初始化预算内运行，超时即暂停，结果持久化后续跑不再重复。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::job::JobRequest;
use crate::store::WorkingContext;

#[async_trait]
pub trait ContextAssembler: Send + Sync {
    /// 创建作业时同步计算的初始摘要，必须便宜
    fn initial_summary(&self, request: &JobRequest) -> String {
        format!("Working on {}: {}", request.subject_id, request.input)
    }

    async fn assemble(&self, request: &JobRequest) -> Result<WorkingContext, String>;
}

/// 固定资料的组装器：subject_id → 预置 JSON，未知对象给空上下文
#[derive(Debug, Clone, Default)]
pub struct StaticContextAssembler {
    profiles: serde_json::Map<String, Value>,
}

impl StaticContextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, subject_id: impl Into<String>, data: Value) -> Self {
        self.profiles.insert(subject_id.into(), data);
        self
    }
}

#[async_trait]
impl ContextAssembler for StaticContextAssembler {
    async fn assemble(&self, request: &JobRequest) -> Result<WorkingContext, String> {
        let data = self
            .profiles
            .get(&request.subject_id)
            .cloned()
            .unwrap_or(Value::Null);
        let summary = if data.is_null() {
            format!("No stored profile for {}", request.subject_id)
        } else {
            format!("Profile loaded for {}", request.subject_id)
        };
        Ok(WorkingContext::new(summary, data))
    }
}
