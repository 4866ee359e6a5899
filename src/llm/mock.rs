//! Mock LLM 客户端（用于测试与 provider = "mock"，无需 API）
//!
//! 回复来源优先级：预置队列 → 自定义 handler → 默认回复。
//! 默认回复：Planner 请求（system 中要求 instrument_name）回 draft_answer 计划，其余回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{last_user_content, Message, Role};

type Handler = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Mock 客户端：按序返回预置回复，并记录收到的全部请求
#[derive(Default)]
pub struct MockLlmClient {
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.lock_queue().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, err: LlmError) -> Self {
        self.lock_queue().push_back(Err(err));
        self
    }

    /// 队列为空时由 handler 根据消息生成回复（测试中按 system prompt 路由）
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// 已收到的请求数
    pub fn call_count(&self) -> usize {
        self.lock_requests().len()
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.lock_requests().clone()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Message>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_reply(messages: &[Message]) -> String {
        let wants_plan = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("instrument_name"));
        if wants_plan {
            return r#"{"instrument_name": "draft_answer", "instrument_args": {}}"#.to_string();
        }
        format!(
            "Echo from Mock: {}",
            last_user_content(messages).unwrap_or("(no input)")
        )
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.lock_requests().push(messages.to_vec());

        if let Some(next) = self.lock_queue().pop_front() {
            return next;
        }
        match &self.handler {
            Some(handler) => handler(messages),
            None => Ok(Self::default_reply(messages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_handler() {
        let mock = MockLlmClient::new()
            .with_response("first")
            .with_handler(|_| Ok("from handler".to_string()));
        assert_eq!(mock.complete(&[Message::user("a")]).await.unwrap(), "first");
        assert_eq!(mock.complete(&[Message::user("b")]).await.unwrap(), "from handler");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests()[1][0].content, "b");
    }

    #[tokio::test]
    async fn test_default_reply_for_planner() {
        let mock = MockLlmClient::new();
        let out = mock
            .complete(&[
                Message::system("Return JSON with instrument_name"),
                Message::user("{}"),
            ])
            .await
            .unwrap();
        assert!(out.contains("draft_answer"));

        let echo = mock.complete(&[Message::user("hello")]).await.unwrap();
        assert_eq!(echo, "Echo from Mock: hello");
    }
}
