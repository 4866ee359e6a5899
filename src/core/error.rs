//! Agent 错误类型与错误分类
//!
//! ErrorKind 将具体错误归入 配置 / 瞬时网络 / 协议 / 上游 四类，供调用方决定是重试整个请求还是直接报错。
//! 策略拦截（ask_user 前置条件不满足）不是错误，由 Dispatcher 记入审计后继续循环。

use thiserror::Error;

use crate::llm::LlmError;
use crate::retrieval::RetrievalError;

/// 单个请求处理过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 缺少凭据或后端配置非法；在任何外部调用之前抛出
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    RetrievalError(#[from] RetrievalError),

    /// Plan JSON 非法、缺少必需键、参数形状不符等
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 请求本身不可处理（如历史中没有用户消息）
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    /// 超时 / 5xx / 429：稍后重试整个请求可能成功
    Transient,
    /// 模型输出或外部响应形状不符：可被调用方捕获并给出干净的失败信息
    Protocol,
    /// 非可重试的上游 HTTP / API 错误、非法请求
    Upstream,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ConfigError(_) => ErrorKind::Configuration,
            AgentError::LlmError(e) => e.kind(),
            AgentError::RetrievalError(e) => e.kind(),
            AgentError::ProtocolError(_) => ErrorKind::Protocol,
            AgentError::InvalidRequest(_) => ErrorKind::Upstream,
        }
    }

    /// 是否值得由调用方重试整个请求
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Protocol)
    }
}

/// HTTP 状态码是否属于瞬时错误
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_config() {
        let err = AgentError::ConfigError("missing HF_API_TOKEN".to_string());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_kind_protocol_is_recoverable() {
        let err = AgentError::ProtocolError("missing instrument_name".to_string());
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_kind_llm_timeout_is_transient() {
        let err = AgentError::from(LlmError::RetriesExhausted { attempts: 3, secs: 60 });
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_kind_http_status() {
        let server = AgentError::from(LlmError::Http { status: 503, body: String::new() });
        assert_eq!(server.kind(), ErrorKind::Transient);
        let client = AgentError::from(LlmError::Http { status: 400, body: String::new() });
        assert_eq!(client.kind(), ErrorKind::Upstream);
    }
}
