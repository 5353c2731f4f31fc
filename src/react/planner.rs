//! 推理步骤：给定上下文与历史，决定下一步（调用工具 / 给出答案 / 放弃）
//!
//! `LlmReasoner` 调用 LLM，`parse_llm_output` 从回复中提取 JSON：
//! `{"tool": "...", "args": {...}}`、`{"final": "..."}` 或 `{"abort": "..."}`；不含 JSON 的纯文本视为最终回答。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::job::JobRequest;
use crate::llm::{LlmClient, Message};
use crate::store::{History, ToolErrorKind, Turn, WorkingContext};

/// 推理步骤的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall {
        /// 可选的思考文本，会记入历史
        thought: Option<String>,
        tool: String,
        params: Value,
    },
    FinalAnswer {
        answer: String,
    },
    /// 推理步骤声明无法继续；作业以 Fatal 失败
    Abort {
        reason: String,
    },
}

/// 一次推理的输入
#[derive(Debug, Clone, Copy)]
pub struct ReasoningInput<'a> {
    pub request: &'a JobRequest,
    pub context: Option<&'a WorkingContext>,
    pub history: &'a History,
    pub iteration: u32,
}

/// 推理依赖：可能慢、可能失败；失败以 Err(String) 返回，由调用器重试并计入熔断
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, input: &ReasoningInput<'_>) -> Result<Decision, String>;
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default, rename = "final")]
    final_answer: Option<String>,
    #[serde(default)]
    abort: Option<String>,
}

/// 解析 LLM 输出为 Decision；JSON 损坏或缺少字段时返回 Err，让调用器重新请求
pub fn parse_llm_output(output: &str) -> Result<Decision, String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err("empty reasoning output".to_string());
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Ok(Decision::FinalAnswer {
                answer: trimmed.to_string(),
            });
        }
    } else {
        return Ok(Decision::FinalAnswer {
            answer: trimmed.to_string(),
        });
    };

    let raw: RawDecision =
        serde_json::from_str(json_str).map_err(|e| format!("{e}: {json_str}"))?;

    if let Some(reason) = raw.abort.filter(|s| !s.trim().is_empty()) {
        return Ok(Decision::Abort { reason });
    }
    if let Some(tool) = raw.tool.filter(|s| !s.trim().is_empty()) {
        return Ok(Decision::ToolCall {
            thought: raw.thought.filter(|s| !s.trim().is_empty()),
            tool,
            params: raw.args.unwrap_or_else(|| Value::Object(Default::default())),
        });
    }
    match raw.final_answer {
        Some(answer) => Ok(Decision::FinalAnswer { answer }),
        None => Err(format!("no tool, final or abort in: {json_str}")),
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful assistant that answers the user's request \
by calling tools. Reply with exactly one JSON object: \
{\"thought\": \"...\", \"tool\": \"<name>\", \"args\": {...}} to call a tool, \
{\"final\": \"<answer>\"} when done, or {\"abort\": \"<reason>\"} if the request cannot be fulfilled. \
If a tool reports breaker_open, it is temporarily unavailable: work around it or answer without it.";

/// 基于 LLM 的推理步骤
pub struct LlmReasoner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    tools_schema: String,
}

impl LlmReasoner {
    pub fn new(llm: Arc<dyn LlmClient>, tools_schema: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            tools_schema: tools_schema.into(),
        }
    }

    /// system + 请求 + 历史 → LLM 消息
    fn build_messages(&self, input: &ReasoningInput<'_>) -> Vec<Message> {
        let mut system = format!("{}\n\nAvailable tools:\n{}", self.system_prompt, self.tools_schema);
        if let Some(ctx) = input.context {
            system.push_str("\n\nContext:\n");
            system.push_str(&ctx.summary);
            if !ctx.data.is_null() {
                system.push('\n');
                system.push_str(&ctx.data.to_string());
            }
        }

        let mut messages = vec![
            Message::system(system),
            Message::user(format!(
                "[{}] {}",
                input.request.subject_id, input.request.input
            )),
        ];
        for turn in input.history.turns() {
            messages.push(match turn {
                Turn::Reasoning { text, .. } => Message::assistant(text.clone()),
                Turn::ToolCall { tool, params, .. } => Message::assistant(
                    serde_json::json!({ "tool": tool, "args": params }).to_string(),
                ),
                Turn::ToolResult { tool, output, .. } => {
                    Message::user(format!("Observation from {tool}:\n{output}"))
                }
                Turn::ToolError {
                    tool,
                    error,
                    message,
                    ..
                } => {
                    let kind = match error {
                        ToolErrorKind::BreakerOpen => "breaker_open",
                        ToolErrorKind::Failed => "failed",
                    };
                    Message::user(format!("Tool {tool} error ({kind}): {message}"))
                }
            });
        }
        messages
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn reason(&self, input: &ReasoningInput<'_>) -> Result<Decision, String> {
        let messages = self.build_messages(input);
        let output = self.llm.complete(&messages).await?;
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::debug!(
            iteration = input.iteration,
            chars = output.len(),
            total_tokens,
            "reasoner output"
        );
        parse_llm_output(&output)
    }
}
