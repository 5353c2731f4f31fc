//! 编排器构建器：从 AppConfig 统一组装存储、熔断、重试、工具与推理步骤
//!
//! 测试与嵌入方可以替换任意协作者（存储、时钟、推理、上下文组装、额外工具）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::error::EngineError;
use crate::core::orchestrator::{ReaperSettings, ResumeOrchestrator};
use crate::core::state_machine::JobStateMachine;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::{ContextAssembler, LlmReasoner, ReactEvent, Reasoner, StaticContextAssembler};
use crate::store::{CheckpointStore, InMemoryJobStore, JobStore};
use crate::tools::{BreakerRegistry, EchoTool, FetchTool, RetryingInvoker, Tool, ToolRegistry};

/// 根据 [llm] 配置选择后端；openai 需要 OPENAI_API_KEY，缺失时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "openai" if std::env::var("OPENAI_API_KEY").is_ok() => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                None,
            ))
        }
        "openai" => {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
            Arc::new(MockLlmClient::default())
        }
        _ => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::default())
        }
    }
}

/// 按 [store] 配置打开作业存储
pub async fn open_store_from_config(cfg: &AppConfig) -> Result<Arc<dyn JobStore>, EngineError> {
    match cfg.store.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(InMemoryJobStore::new())),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            let store = crate::store::SqliteJobStore::new(&cfg.store.sqlite_path).await?;
            tracing::info!(path = %cfg.store.sqlite_path.display(), "Using SQLite job store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => Err(EngineError::ConfigError(
            "store.backend = \"sqlite\" requires the async-sqlite feature".into(),
        )),
        other => Err(EngineError::ConfigError(format!(
            "unknown store backend: {other}"
        ))),
    }
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    store: Option<Arc<dyn JobStore>>,
    clock: Arc<dyn Clock>,
    reasoner: Option<Arc<dyn Reasoner>>,
    assembler: Option<Arc<dyn ContextAssembler>>,
    extra_tools: Vec<Arc<dyn Tool>>,
    builtin_tools: bool,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            reasoner: None,
            assembler: None,
            extra_tools: Vec::new(),
            builtin_tools: true,
            event_tx: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn ContextAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// 是否注册内置 echo / fetch 工具
    pub fn with_builtin_tools(mut self, enable: bool) -> Self {
        self.builtin_tools = enable;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 统一的工具注册表
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        if self.builtin_tools {
            tools.register(EchoTool);
            tools.register(FetchTool::new(
                self.config.tools.fetch.allowed_domains.clone(),
                Duration::from_millis(self.config.tools.per_tool_timeout_ms),
                self.config.tools.fetch.max_result_chars,
            ));
        }
        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        tools
    }

    pub async fn build(self) -> Result<ResumeOrchestrator, EngineError> {
        self.config.validate()?;

        let store = match &self.store {
            Some(store) => store.clone(),
            None => open_store_from_config(&self.config).await?,
        };
        let tools = self.build_tool_registry();
        let reasoner = match &self.reasoner {
            Some(r) => r.clone(),
            None => Arc::new(LlmReasoner::new(
                create_llm_from_config(&self.config),
                tools.to_schema_json(),
            )),
        };
        let assembler = self
            .assembler
            .clone()
            .unwrap_or_else(|| Arc::new(StaticContextAssembler::new()));

        let breakers = Arc::new(BreakerRegistry::new(
            self.config.breaker.policy(),
            self.clock.clone(),
        ));
        let cfg = &self.config;
        tracing::info!(
            tools = ?tools.tool_names(),
            max_iterations = cfg.engine.max_iterations,
            store = %cfg.store.backend,
            "orchestrator ready"
        );

        Ok(ResumeOrchestrator {
            jobs: Arc::new(JobStateMachine::new(store.clone(), self.clock.clone())),
            checkpoints: CheckpointStore::new(store, self.clock.clone()),
            invoker: RetryingInvoker::new(breakers, cfg.tools.retry_policy(), self.clock.clone()),
            tools,
            reasoner,
            assembler,
            policy: cfg.engine.budget_policy(),
            max_iterations: cfg.engine.max_iterations,
            max_stalled_invocations: cfg.engine.max_stalled_invocations,
            heartbeat_interval: Duration::from_millis(cfg.engine.heartbeat_interval_ms),
            reaper: ReaperSettings {
                stale_threshold: Duration::from_millis(cfg.reaper.stale_heartbeat_threshold_ms),
                retry_ceiling: cfg.reaper.retry_ceiling,
                interval: Duration::from_millis(cfg.reaper.interval_ms),
            },
            event_tx: self.event_tx,
        })
    }
}
