//! Triage - 客服智能体编排引擎
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（组件装配 + 单请求入口 handle）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求状态（RequestState）与错误分类
//! - **llm**: LLM / Embedding / Reranker 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息（role/content）
//! - **observability**: tracing 日志初始化
//! - **react**: Planner、Dispatcher、Observer、Finalizer、ReAct 主循环
//! - **retrieval**: 分块、向量索引、检索器与证据聚合
//! - **text**: 文本规整 / 实体抽取协作方

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod retrieval;
pub mod text;

pub use agent::{Agent, AgentReply, AgentRequest, RequestInput};
pub use core::{AgentError, ErrorKind};
