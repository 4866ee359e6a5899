//! 检索器：单次查询 → 候选片段
//!
//! Retriever 是检索树 / 向量库等外部组件的窄接口；HttpRetriever 对接外部检索服务，
//! IndexRetriever（见 index.rs）使用进程内共享的向量索引。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::core::error::is_transient_status;
use crate::core::ErrorKind;
use crate::llm::LlmError;

/// 检索错误
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Retrieval timed out: {0}")]
    Timeout(String),

    #[error("Retrieval HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Retrieval request failed: {0}")]
    Request(String),

    #[error("Invalid retrieval response: {0}")]
    InvalidResponse(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] LlmError),

    /// 知识库缺失或不可读
    #[error("Index error: {0}")]
    Index(String),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::Timeout(_) | RetrievalError::Request(_) => ErrorKind::Transient,
            RetrievalError::Http { status, .. } if is_transient_status(*status) => {
                ErrorKind::Transient
            }
            RetrievalError::Http { .. } => ErrorKind::Upstream,
            RetrievalError::InvalidResponse(_) => ErrorKind::Protocol,
            RetrievalError::Embedding(e) => e.kind(),
            RetrievalError::Index(_) => ErrorKind::Configuration,
        }
    }
}

/// 检索返回的候选片段
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrievedChunk {
    /// 字符串或数字均可，统一转为字符串
    #[serde(deserialize_with = "chunk_id_from_any")]
    pub chunk_id: String,
    pub text: String,
    #[serde(default, deserialize_with = "metadata_or_empty")]
    pub metadata: Map<String, Value>,
}

impl RetrievedChunk {
    pub fn new(chunk_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn chunk_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "chunk_id must be a string or number, got {}",
            other
        ))),
    }
}

fn metadata_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// 检索接口：对一个查询返回至多 top_k 个候选
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// 外部检索服务：POST `{query, top_k}`，响应为候选数组或 `{"results": [...]}`
pub struct HttpRetriever {
    client: reqwest::Client,
    url: String,
}

impl HttpRetriever {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RetrievalError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "top_k": top_k }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout(e.to_string())
                } else {
                    RetrievalError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Http {
                status: status.as_u16(),
                body: body.chars().take(1000).collect(),
            });
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;
        parse_chunks(data)
    }
}

pub(crate) fn parse_chunks(data: Value) -> Result<Vec<RetrievedChunk>, RetrievalError> {
    let items = match data {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RetrievalError::InvalidResponse(
                    "expected an array or {\"results\": [...]}".to_string(),
                ))
            }
        },
        other => {
            return Err(RetrievalError::InvalidResponse(format!(
                "unexpected payload: {}",
                other
            )))
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| RetrievalError::InvalidResponse(e.to_string()))
        })
        .collect()
}
