//! Mock LLM 客户端（无需 API）
//!
//! 按顺序回放预设回复，用完后重复最后一条；用于演示驱动与测试。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

#[derive(Debug)]
pub struct MockLlmClient {
    replies: Vec<String>,
    cursor: Mutex<usize>,
}

impl MockLlmClient {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            cursor: Mutex::new(0),
        }
    }

    /// 先调用一次 echo 工具，再给出最终回复
    pub fn echo_then_answer() -> Self {
        Self::new(vec![
            r#"{"thought": "check the tool path", "tool": "echo", "args": {"text": "ping"}}"#
                .to_string(),
            r#"{"final": "Echo tool answered; request handled by the mock model."}"#.to_string(),
        ])
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::echo_then_answer()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let reply = self
            .replies
            .get(*cursor)
            .or_else(|| self.replies.last())
            .cloned()
            .ok_or_else(|| "mock has no replies".to_string())?;
        *cursor += 1;
        Ok(reply)
    }
}
