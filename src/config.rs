//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__ENGINE__MAX_ITERATIONS=40`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::budget::BudgetPolicy;
use crate::core::error::EngineError;
use crate::tools::{BreakerPolicy, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub breaker: BreakerSection,
    pub reaper: ReaperSection,
    pub store: StoreSection,
    pub llm: LlmSection,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.engine.validate()?;
        if self.breaker.failure_threshold == 0 {
            return Err(EngineError::ConfigError(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.tools.per_tool_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "tools.per_tool_timeout_ms must be positive".into(),
            ));
        }
        if self.reaper.stale_heartbeat_threshold_ms == 0 || self.reaper.interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "reaper thresholds must be positive".into(),
            ));
        }
        if self.engine.heartbeat_interval_ms > 0
            && self.engine.heartbeat_interval_ms >= self.reaper.stale_heartbeat_threshold_ms
        {
            tracing::warn!(
                heartbeat_ms = self.engine.heartbeat_interval_ms,
                stale_ms = self.reaper.stale_heartbeat_threshold_ms,
                "heartbeat interval is not shorter than the reaper threshold; live jobs may be reaped"
            );
        }
        Ok(())
    }
}

/// [engine] 段：预算分配与迭代上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 初始化未完成时，调用预算中留给初始化的比例
    pub initialization_ratio: f64,
    /// 从硬截止时间中扣除的余量，用于写检查点与返回响应
    pub safety_margin_ms: u64,
    /// iteration_index 的硬上限，与时间无关
    pub max_iterations: u32,
    /// 跨所有调用的累计耗时上限
    pub job_time_budget_ms: Option<u64>,
    /// 连续多少次调用毫无推进后判定依赖不可用并失败
    pub max_stalled_invocations: u32,
    /// 后台心跳间隔，0 表示只在每轮提交时刷新
    pub heartbeat_interval_ms: u64,
    /// 演示驱动每次调用的硬截止窗口
    pub invocation_window_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            initialization_ratio: 0.6,
            safety_margin_ms: 3_000,
            max_iterations: 25,
            job_time_budget_ms: Some(900_000),
            max_stalled_invocations: 5,
            heartbeat_interval_ms: 5_000,
            invocation_window_ms: 60_000,
        }
    }
}

impl EngineSection {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.initialization_ratio) {
            return Err(EngineError::ConfigError(format!(
                "engine.initialization_ratio must be within [0, 1], got {}",
                self.initialization_ratio
            )));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::ConfigError(
                "engine.max_iterations must be at least 1".into(),
            ));
        }
        if self.max_stalled_invocations == 0 {
            return Err(EngineError::ConfigError(
                "engine.max_stalled_invocations must be at least 1".into(),
            ));
        }
        if self.job_time_budget_ms == Some(0) {
            return Err(EngineError::ConfigError(
                "engine.job_time_budget_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn budget_policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            initialization_ratio: self.initialization_ratio,
            safety_margin: Duration::from_millis(self.safety_margin_ms),
            job_time_budget: self.job_time_budget_ms.map(Duration::from_millis),
        }
    }
}

/// [tools] 段：单次超时、重试与退避，及内置 fetch 工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub per_tool_timeout_ms: u64,
    /// 剩余时间低于此值就不再发起尝试；高于此值时单次超时截到剩余时间
    pub min_attempt_ms: u64,
    pub per_tool_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub fetch: FetchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            per_tool_timeout_ms: 10_000,
            min_attempt_ms: 1_000,
            per_tool_max_retries: 2,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            fetch: FetchSection::default(),
        }
    }
}

impl ToolsSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            per_attempt_timeout: Duration::from_millis(self.per_tool_timeout_ms),
            min_attempt: Duration::from_millis(self.min_attempt_ms.min(self.per_tool_timeout_ms)),
            max_retries: self.per_tool_max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// [tools.fetch] 段：允许的域名白名单与结果截断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub allowed_domains: Vec<String>,
    pub max_result_chars: usize,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            allowed_domains: vec![
                "api.open-meteo.com".into(),
                "en.wikipedia.org".into(),
                "api.github.com".into(),
            ],
            max_result_chars: 8_000,
        }
    }
}

/// [breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub open_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_ms: 30_000,
        }
    }
}

impl BreakerSection {
    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold,
            open_for: Duration::from_millis(self.open_ms),
        }
    }
}

/// [reaper] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    pub stale_heartbeat_threshold_ms: u64,
    pub retry_ceiling: u32,
    pub interval_ms: u64,
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            stale_heartbeat_threshold_ms: 30_000,
            retry_ceiling: 3,
            interval_ms: 10_000,
        }
    }
}

/// [store] 段：memory / sqlite（需启用 async-sqlite feature）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/relay.db"),
        }
    }
}

/// [llm] 段：mock / openai（OpenAI 兼容端点）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        let policy = cfg.engine.budget_policy();
        assert_eq!(policy.safety_margin, Duration::from_secs(3));
        assert_eq!(policy.job_time_budget, Some(Duration::from_secs(900)));
        assert_eq!(cfg.engine.max_stalled_invocations, 5);
        assert_eq!(cfg.tools.retry_policy().min_attempt, Duration::from_secs(1));
        assert_eq!(cfg.tools.retry_policy().max_retries, 2);
        assert_eq!(cfg.breaker.policy().failure_threshold, 3);
    }

    #[test]
    fn test_rejects_bad_ratio_and_zero_threshold() {
        let mut cfg = AppConfig::default();
        cfg.engine.initialization_ratio = 1.5;
        assert!(matches!(cfg.validate(), Err(EngineError::ConfigError(_))));

        let mut cfg = AppConfig::default();
        cfg.breaker.failure_threshold = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::ConfigError(_))));

        let mut cfg = AppConfig::default();
        cfg.engine.max_stalled_invocations = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_iterations = 7\njob_time_budget_ms = 120000\n\n[breaker]\nopen_ms = 500"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_iterations, 7);
        assert_eq!(cfg.engine.job_time_budget_ms, Some(120_000));
        assert_eq!(cfg.breaker.open_ms, 500);
        // 未出现的键保持默认
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.reaper.retry_ceiling, 3);
    }
}
