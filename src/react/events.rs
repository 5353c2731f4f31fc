//! 作业过程事件：供 CLI / 前端展示思考、工具调用、观察与暂停

use serde::Serialize;

use crate::core::error::JobFailure;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 本次调用已占有作业
    Claimed { job_id: String, iteration: u32 },
    /// 上下文组装完成并已提交
    Initialized { job_id: String },
    /// 推理步骤的思考内容
    Reasoning { iteration: u32, text: String },
    ToolCall {
        iteration: u32,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        iteration: u32,
        tool: String,
        preview: String,
    },
    /// 工具失败；breaker_open 表示未发起调用
    ToolFailure {
        iteration: u32,
        tool: String,
        breaker_open: bool,
        reason: String,
    },
    /// 预算用尽，已写检查点
    Paused { job_id: String, iteration: u32 },
    Completed { job_id: String },
    Failed { job_id: String, error: JobFailure },
    /// 作业已被其它调用或 Reaper 接手，本次调用退出
    Superseded { job_id: String },
}
