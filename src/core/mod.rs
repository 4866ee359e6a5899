//! 核心层：请求状态与错误分类

pub mod error;
pub mod state;

pub use error::{AgentError, ErrorKind};
pub use state::{Entity, EvidenceItem, RequestState, StepAudit};
