//! Agent 运行时：由配置装配全部组件，对单个请求跑 ReAct 循环并返回回复
//!
//! from_config 在任何外部调用之前完成校验（缺凭据、未知后端均为配置错误）；
//! builder 供测试或嵌入方注入自定义的 LLM / 检索 / 重排实现。
//! Agent 只持有不可变组件（Arc），可被多个并发请求共享。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{AgentSection, AppConfig};
use crate::core::{AgentError, Entity, RequestState};
use crate::llm::{
    EmbeddingProvider, EmbeddingReranker, HttpReranker, LlmClient, MockLlmClient, OpenAiClient,
    OpenAiEmbedder, Reranker, RetryConfig, RetryingLlmClient, Sampling,
};
use crate::memory::{last_user_content, Message};
use crate::react::{react_loop, Dispatcher, Finalizer, ObservationSummarizer, Planner, ReactSession};
use crate::retrieval::{
    AggregatorConfig, Chunker, ChunkingConfig, EvidenceAggregator, HttpRetriever, IndexRetriever,
    Retriever, SharedIndex,
};
use crate::text::{BasicTextProcessor, TextProcessor};

/// 请求输入：单条消息，或完整聊天记录（取最后一条用户消息为原文）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestInput {
    Message(String),
    History(Vec<Message>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: String,
    pub input: RequestInput,
}

impl AgentRequest {
    pub fn message(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            input: RequestInput::Message(text.into()),
        }
    }

    pub fn history(request_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            request_id: request_id.into(),
            input: RequestInput::History(messages),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub message: String,
    pub is_support_needed: bool,
}

pub struct Agent {
    planner: Planner,
    dispatcher: Dispatcher,
    observer: ObservationSummarizer,
    finalizer: Finalizer,
    text: Arc<dyn TextProcessor>,
    settings: AgentSection,
}

/// 组件注入式构建
pub struct AgentBuilder {
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn Retriever>,
    reranker: Arc<dyn Reranker>,
    text: Arc<dyn TextProcessor>,
    settings: AgentSection,
    candidates_per_query: usize,
}

impl AgentBuilder {
    pub fn with_text_processor(mut self, text: Arc<dyn TextProcessor>) -> Self {
        self.text = text;
        self
    }

    pub fn with_settings(mut self, settings: AgentSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_candidates_per_query(mut self, candidates: usize) -> Self {
        self.candidates_per_query = candidates;
        self
    }

    pub fn build(self) -> Agent {
        let aggregator = EvidenceAggregator::new(
            self.llm.clone(),
            self.retriever,
            self.reranker,
            AggregatorConfig {
                max_query_variants: self.settings.max_query_variants,
                candidates_per_query: self.candidates_per_query,
            },
        );
        Agent {
            planner: Planner::new(self.llm.clone()),
            dispatcher: Dispatcher::new(
                self.llm.clone(),
                Arc::new(aggregator),
                self.settings.default_top_k,
            ),
            observer: ObservationSummarizer::new(self.llm.clone()),
            finalizer: Finalizer::new(self.llm),
            text: self.text,
            settings: self.settings,
        }
    }
}

impl Agent {
    pub fn builder(
        llm: Arc<dyn LlmClient>,
        retriever: Arc<dyn Retriever>,
        reranker: Arc<dyn Reranker>,
    ) -> AgentBuilder {
        AgentBuilder {
            llm,
            retriever,
            reranker,
            text: Arc::new(BasicTextProcessor),
            settings: AgentSection::default(),
            candidates_per_query: AggregatorConfig::default().candidates_per_query,
        }
    }

    /// 从配置装配：LLM（带超时重试）、检索后端、重排后端
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let api_key = cfg.llm.resolve_api_key();
        let llm = create_llm(cfg, api_key.as_deref())?;

        // 嵌入仅在本地索引或嵌入重排时需要
        let needs_embedder =
            cfg.retrieval.backend.eq_ignore_ascii_case("index") || cfg.rerank.backend.eq_ignore_ascii_case("embedding");
        let embedder: Option<Arc<dyn EmbeddingProvider>> = if needs_embedder {
            let key = api_key.as_deref().ok_or_else(|| {
                AgentError::ConfigError(
                    "embeddings require an API key (llm.api_key, HF_API_TOKEN or OPENAI_API_KEY)".to_string(),
                )
            })?;
            let base = cfg.embedding.base_url.as_deref().or(cfg.llm.base_url.as_deref());
            Some(Arc::new(OpenAiEmbedder::new(
                base,
                &cfg.embedding.model,
                key,
                cfg.embedding.timeout_secs,
            )))
        } else {
            None
        };

        let retriever = create_retriever(cfg, embedder.clone())?;
        let reranker = create_reranker(cfg, api_key, embedder)?;

        Ok(Self::builder(llm, retriever, reranker)
            .with_settings(cfg.agent.clone())
            .with_candidates_per_query(cfg.retrieval.candidates_per_query)
            .build())
    }

    /// 处理单个请求
    pub async fn handle(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        self.handle_with_state(request).await.map(|(reply, _)| reply)
    }

    /// 处理单个请求，同时返回结束时的 RequestState（审计 / 证据用于诊断）
    pub async fn handle_with_state(
        &self,
        request: AgentRequest,
    ) -> Result<(AgentReply, RequestState), AgentError> {
        let (raw, history) = match request.input {
            RequestInput::Message(text) => {
                let history = vec![Message::user(text.clone())];
                (text, history)
            }
            RequestInput::History(messages) => {
                let raw = last_user_content(&messages)
                    .ok_or_else(|| AgentError::InvalidRequest("chat history has no user message".to_string()))?
                    .to_string();
                (raw, messages)
            }
        };

        let norm = self.text.normalize(&raw);
        let (names, types) = self.text.extract_entities(&norm);
        let entities = Entity::from_parallel(&names, &types);

        let mut state = RequestState::new(request.request_id, raw)
            .with_history(history)
            .with_norm_text(norm)
            .with_entities(entities);

        let session = ReactSession::new(&self.planner, &self.dispatcher, &self.observer, &self.finalizer)
            .with_max_iterations(self.settings.max_iterations)
            .with_summary_chars(self.settings.summary_chars);

        let result = match react_loop(&session, &mut state).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(request_id = %state.request_id, kind = ?e.kind(), error = %e, "request failed");
                return Err(e);
            }
        };

        // Agent 级累计值（跨请求共享同一 LLM 客户端）
        let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
        tracing::info!(
            request_id = %state.request_id,
            steps = state.steps().len(),
            evidence = state.evidence().len(),
            support_needed = result.support_needed,
            cumulative_prompt_tokens = prompt_tokens,
            cumulative_completion_tokens = completion_tokens,
            cumulative_total_tokens = total_tokens,
            "request completed"
        );

        Ok((
            AgentReply {
                message: result.message,
                is_support_needed: result.support_needed,
            },
            state,
        ))
    }
}

fn create_llm(cfg: &AppConfig, api_key: Option<&str>) -> Result<Arc<dyn LlmClient>, AgentError> {
    let inner: Arc<dyn LlmClient> = match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::warn!("using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        "openai" => {
            let key = api_key.ok_or_else(|| {
                AgentError::ConfigError(
                    "llm.provider = openai requires llm.api_key, HF_API_TOKEN or OPENAI_API_KEY".to_string(),
                )
            })?;
            tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                key,
                Sampling {
                    temperature: cfg.llm.temperature,
                    max_tokens: cfg.llm.max_tokens,
                },
            ))
        }
        other => {
            return Err(AgentError::ConfigError(format!("unknown llm provider: {}", other)));
        }
    };
    Ok(Arc::new(RetryingLlmClient::new(
        inner,
        RetryConfig::new(cfg.llm.max_retries, cfg.llm.timeout_secs),
    )))
}

fn create_retriever(
    cfg: &AppConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<dyn Retriever>, AgentError> {
    let section = &cfg.retrieval;
    match section.backend.to_lowercase().as_str() {
        "index" => {
            let embedder = embedder
                .ok_or_else(|| AgentError::ConfigError("index retrieval requires an embedder".to_string()))?;
            let chunking = ChunkingConfig {
                chunk_size: section.chunk_size,
                chunk_overlap: section.chunk_overlap,
            };
            chunking
                .validate()
                .map_err(|e| AgentError::ConfigError(format!("retrieval: {}", e)))?;
            let chunker = Chunker::new(chunking);
            let index = SharedIndex::new(section.knowledge_base.clone(), chunker, embedder);
            Ok(Arc::new(IndexRetriever::new(Arc::new(index))))
        }
        "http" => {
            let url = section
                .url
                .as_deref()
                .ok_or_else(|| AgentError::ConfigError("retrieval.backend = http requires retrieval.url".to_string()))?;
            Ok(Arc::new(HttpRetriever::new(url, section.timeout_secs)?))
        }
        other => Err(AgentError::ConfigError(format!("unknown retrieval backend: {}", other))),
    }
}

fn create_reranker(
    cfg: &AppConfig,
    api_key: Option<String>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<dyn Reranker>, AgentError> {
    match cfg.rerank.backend.to_lowercase().as_str() {
        "embedding" => {
            let embedder = embedder
                .ok_or_else(|| AgentError::ConfigError("embedding rerank requires an embedder".to_string()))?;
            Ok(Arc::new(EmbeddingReranker::new(embedder)))
        }
        "http" => {
            let url = cfg.rerank.endpoint(cfg.llm.base_url.as_deref());
            Ok(Arc::new(HttpReranker::new(url, api_key, cfg.rerank.timeout_secs)?))
        }
        other => Err(AgentError::ConfigError(format!("unknown rerank backend: {}", other))),
    }
}
