//! 集成测试共用的脚本化协作者

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use relay::config::AppConfig;
use relay::core::{Clock, JobRequest, OrchestratorBuilder, ResumeOrchestrator, TokioClock};
use relay::react::{ContextAssembler, Decision, Reasoner, ReasoningInput};
use relay::store::{InMemoryJobStore, JobStore, WorkingContext};
use relay::tools::Tool;

/// 按脚本给出决定，脚本用完后一直返回 fallback；记录每次看到的历史长度与调用时刻
pub struct ScriptedReasoner {
    delay: Duration,
    script: Mutex<VecDeque<Decision>>,
    fallback: Decision,
    pub calls: AtomicU32,
    pub seen_history: Mutex<Vec<usize>>,
    pub seen_at: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedReasoner {
    pub fn new(delay: Duration, script: Vec<Decision>, fallback: Decision) -> Self {
        Self {
            delay,
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            seen_history: Mutex::new(Vec::new()),
            seen_at: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(delay: Duration, script: Vec<Decision>) -> Self {
        Self::new(delay, script, final_answer("all done"))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn reason(&self, input: &ReasoningInput<'_>) -> Result<Decision, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().unwrap().push(input.history.len());
        self.seen_at.lock().unwrap().push(tokio::time::Instant::now());
        tokio::time::sleep(self.delay).await;
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// 每次组装耗时按队列取，队列空了则立即完成
pub struct TimedAssembler {
    durations: Mutex<VecDeque<Duration>>,
    pub calls: AtomicU32,
}

impl TimedAssembler {
    pub fn new(durations: Vec<Duration>) -> Self {
        Self {
            durations: Mutex::new(durations.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn instant() -> Self {
        Self::new(vec![])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextAssembler for TimedAssembler {
    async fn assemble(&self, request: &JobRequest) -> Result<WorkingContext, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let d = self.durations.lock().unwrap().pop_front().unwrap_or_default();
        tokio::time::sleep(d).await;
        Ok(WorkingContext::new(
            format!("Profile for {}", request.subject_id),
            json!({ "subject": request.subject_id }),
        ))
    }
}

/// 计数工具：固定耗时，固定成功或失败
pub struct CountingTool {
    name: String,
    delay: Duration,
    fail: bool,
    pub calls: AtomicU32,
}

impl CountingTool {
    pub fn ok(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
            fail: false,
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
            fail: true,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            Err(format!("{} unavailable (503)", self.name))
        } else {
            Ok(format!("{} ok for {}", self.name, args))
        }
    }
}

pub fn tool_call(tool: &str) -> Decision {
    Decision::ToolCall {
        thought: None,
        tool: tool.to_string(),
        params: json!({ "city": "Oslo" }),
    }
}

pub fn final_answer(text: &str) -> Decision {
    Decision::FinalAnswer {
        answer: text.to_string(),
    }
}

/// 测试用配置：2s 余量、单次工具超时 2s、不重试、心跳 1s
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.engine.safety_margin_ms = 2_000;
    cfg.engine.heartbeat_interval_ms = 1_000;
    cfg.tools.per_tool_timeout_ms = 2_000;
    cfg.tools.per_tool_max_retries = 0;
    cfg.tools.backoff_base_ms = 10;
    cfg.tools.backoff_max_ms = 10;
    cfg
}

pub struct Engine {
    pub orchestrator: ResumeOrchestrator,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn JobStore>,
}

impl Engine {
    pub fn deadline_in(&self, window: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(window).unwrap()
    }
}

pub async fn engine(
    cfg: AppConfig,
    reasoner: Arc<dyn Reasoner>,
    assembler: Arc<dyn ContextAssembler>,
    tools: Vec<Arc<dyn Tool>>,
) -> Engine {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let mut builder = OrchestratorBuilder::new(cfg)
        .with_store(store.clone())
        .with_clock(clock.clone())
        .with_reasoner(reasoner)
        .with_assembler(assembler)
        .with_builtin_tools(false);
    for tool in tools {
        builder = builder.with_tool(tool);
    }
    Engine {
        orchestrator: builder.build().await.unwrap(),
        clock,
        store,
    }
}
