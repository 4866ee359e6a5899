//! LLM 客户端抽象
//!
//! 所有对话后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；
//! RetryingLlmClient 为任意后端加上单次调用超时与「仅超时重试」的有界重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::error::is_transient_status;
use crate::core::ErrorKind;
use crate::memory::Message;

/// LLM / Embedding / Reranker 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// 单次调用超时
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// 超时重试次数耗尽
    #[error("Request timed out after {attempts} attempt(s) (timeout={secs}s)")]
    RetriesExhausted { attempts: u32, secs: u64 },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("API error: {0}")]
    Api(String),

    /// 响应形状不符（缺 choices、非数组等）
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::MissingCredentials(_) => ErrorKind::Configuration,
            LlmError::Timeout(_) | LlmError::RetriesExhausted { .. } => ErrorKind::Transient,
            LlmError::Http { status, .. } if is_transient_status(*status) => ErrorKind::Transient,
            LlmError::Http { .. } | LlmError::Api(_) => ErrorKind::Upstream,
            LlmError::InvalidResponse(_) => ErrorKind::Protocol,
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略：总尝试次数（含首次）与单次超时
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, timeout_secs: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, 60)
    }
}

/// 带超时与重试的包装：仅在超时时重试，HTTP / API 错误立即返回
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.timeout, self.inner.complete(messages)).await {
                Ok(Ok(content)) => return Ok(content),
                Ok(Err(LlmError::Timeout(reason))) => {
                    tracing::warn!(attempt, attempts, %reason, "chat completion timed out");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        timeout_secs = self.config.timeout.as_secs_f32(),
                        "chat completion timed out"
                    );
                }
            }
        }
        Err(LlmError::RetriesExhausted {
            attempts,
            secs: self.config.timeout.as_secs(),
        })
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
