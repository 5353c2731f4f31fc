//! Relay - 可续跑的限时任务执行引擎
//!
//! 宿主进程有硬性执行时限时，长任务按预算分段执行：预算用尽前写检查点并返回 paused，
//! 调用方携带 job id 再次调用即从检查点续跑。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 作业状态机、时间预算、Reaper、Resume Orchestrator
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化
//! - **react**: 推理步骤、上下文组装与迭代循环
//! - **store**: 作业存储（内存 / SQLite）与检查点
//! - **tools**: 工具注册表、熔断器、重试调用器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;

pub use crate::core::{EngineError, JobRequest, Outcome, ResumeOrchestrator};
