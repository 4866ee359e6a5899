//! 重排：对「原始查询 × 候选文档」打分
//!
//! - HttpReranker：HF 句向量相似度接口 `{"inputs": {"source_sentence", "sentences"}}`，
//!   响应可为按位置对齐的分数数组，或带 index 的 `[{index, score}]`
//! - EmbeddingReranker：没有专用重排模型时，用嵌入余弦相似度代替

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::embedding::{align_embeddings, cosine_similarity};
use crate::llm::{EmbeddingProvider, LlmError};

/// 重排器：返回与 documents 对齐的分数（越高越相关）；返回条数可能少于文档数，由调用方补齐
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError>;
}

/// 外部 HTTP 重排服务
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let payload = json!({
            "inputs": { "source_sentence": query, "sentences": documents }
        });
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(url = %self.url, documents = documents.len(), "posting reranker request");
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(1000).collect(),
            });
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_scores(&data, documents.len())
    }
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> LlmError {
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

/// 解析重排响应：数字数组（按位置），或 `[{index, score | relevance_score}]`（按 index 放回对应位置，缺失为 0）
fn parse_scores(data: &Value, documents: usize) -> Result<Vec<f32>, LlmError> {
    let items = data.as_array().ok_or_else(|| {
        LlmError::InvalidResponse(format!("unexpected reranker payload: {}", data))
    })?;

    if items.iter().all(Value::is_number) {
        return Ok(items.iter().filter_map(Value::as_f64).map(|s| s as f32).collect());
    }

    let mut scores = vec![0.0f32; documents];
    for item in items {
        let index = item.get("index").and_then(Value::as_u64);
        let score = item
            .get("score")
            .or_else(|| item.get("relevance_score"))
            .and_then(Value::as_f64);
        match (index, score) {
            (Some(i), Some(s)) if (i as usize) < documents => scores[i as usize] = s as f32,
            (Some(i), Some(_)) => {
                tracing::warn!(index = i, documents, "reranker index out of range");
            }
            _ => {
                return Err(LlmError::InvalidResponse(format!(
                    "could not parse reranker item: {}",
                    item
                )))
            }
        }
    }
    Ok(scores)
}

/// 用嵌入余弦相似度打分
pub struct EmbeddingReranker {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let mut texts = Vec::with_capacity(documents.len() + 1);
        texts.push(query.to_string());
        texts.extend(documents.iter().cloned());

        let vectors = align_embeddings(self.embedder.embed(&texts).await?, texts.len());
        let (query_vec, doc_vecs) = vectors.split_at(1);
        Ok(doc_vecs
            .iter()
            .map(|v| cosine_similarity(&query_vec[0], v))
            .collect())
    }
}
