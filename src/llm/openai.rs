//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 Hugging Face router、OpenAI、自建 vLLM/sglang 等。
//! 超时与重试由外层 RetryingLlmClient 负责，这里只做请求构造与错误分类。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 采样参数
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    sampling: Sampling,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 必须由调用方解析好（缺失属于配置错误，在装配阶段就应拒绝）
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, sampling: Sampling) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(api_base(url))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config).with_backoff(no_backoff()),
            model: model.to_string(),
            sampling,
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(map_openai_error)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(map_openai_error)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(map_openai_error)?,
                    ),
                };
                Ok(msg)
            })
            .collect()
    }
}

/// 端点根地址统一补齐 /v1（配置里可写 https://router.huggingface.co 或 .../v1）
pub(crate) fn api_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// 关闭 async_openai 内置的 5xx / 429 退避重试：首次失败即返回
pub(crate) fn no_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

/// 将 async_openai 错误归类为 LlmError
pub(crate) fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                LlmError::Timeout(e.to_string())
            } else if let Some(status) = e.status() {
                LlmError::Http {
                    status: status.as_u16(),
                    body: e.to_string(),
                }
            } else {
                LlmError::Api(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => LlmError::Api(api.message),
        e @ OpenAIError::JSONDeserialize(..) => LlmError::InvalidResponse(e.to_string()),
        other => LlmError::Api(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    #[allow(deprecated)]
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .temperature(self.sampling.temperature);
        if let Some(max_tokens) = self.sampling.max_tokens {
            args.max_tokens(max_tokens);
        }
        let request = args.build().map_err(map_openai_error)?;

        tracing::debug!(model = %self.model, messages = messages.len(), "posting chat completion");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response.choices.first().ok_or_else(|| {
            LlmError::InvalidResponse("chat completion returned no choices".to_string())
        })?;
        Ok(choice.message.content.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::llm::embedding::{EmbeddingProvider, OpenAiEmbedder};
    use crate::llm::{RetryConfig, RetryingLlmClient};

    /// 本地桩服务：对每个请求读完后返回 HTTP 500，并统计命中次数
    async fn spawn_failing_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        if let Some(head_end) = text.find("\r\n\r\n") {
                            let content_length = text[..head_end]
                                .lines()
                                .filter_map(|l| l.split_once(':'))
                                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if buf.len() >= head_end + 4 + content_length {
                                break;
                            }
                        }
                    }
                    let body = "upstream exploded";
                    let response = format!(
                        "HTTP/1.1 500 Internal Server Error\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), hits)
    }

    #[tokio::test]
    async fn test_server_error_propagates_without_retry() {
        let (base, hits) = spawn_failing_server().await;
        let inner = Arc::new(OpenAiClient::new(Some(&base), "m", "k", Sampling::default()));
        let client = RetryingLlmClient::new(inner, RetryConfig::new(2, 5));

        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();

        assert!(!matches!(err, LlmError::RetriesExhausted { .. }), "got {:?}", err);
        assert!(!matches!(err, LlmError::Timeout(_)), "got {:?}", err);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedding_server_error_not_retried() {
        let (base, hits) = spawn_failing_server().await;
        let embedder = OpenAiEmbedder::new(Some(&base), "e", "k", 5);

        let err = embedder.embed(&["refund".to_string()]).await.unwrap_err();

        assert!(!matches!(err, LlmError::Timeout(_)), "got {:?}", err);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_api_base_appends_version_once() {
        assert_eq!(api_base("https://router.huggingface.co"), "https://router.huggingface.co/v1");
        assert_eq!(api_base("http://localhost:30000/v1/"), "http://localhost:30000/v1");
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
