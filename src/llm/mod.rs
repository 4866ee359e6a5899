//! LLM 层：对话 / 嵌入 / 重排客户端抽象与实现（OpenAI 兼容 / HTTP / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod rerank;
pub mod traits;

pub use embedding::{EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, Sampling, TokenUsage};
pub use rerank::{EmbeddingReranker, HttpReranker, Reranker};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
