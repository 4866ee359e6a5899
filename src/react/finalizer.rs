//! Finalizer：仅在 finalize_required 时运行，基于最新草稿与证据（E1..En）生成带 [E#] 引用的最终回复

use std::sync::Arc;

use crate::core::{AgentError, RequestState};
use crate::llm::LlmClient;
use crate::react::prompts;

pub struct Finalizer {
    llm: Arc<dyn LlmClient>,
}

impl Finalizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn finalize(&self, state: &RequestState) -> Result<String, AgentError> {
        let messages = prompts::finalize_messages(state);
        let answer = self.llm.complete(&messages).await?.trim().to_string();
        tracing::info!(
            request_id = %state.request_id,
            evidence = state.evidence().len(),
            length = answer.chars().count(),
            "final answer assembled"
        );
        Ok(answer)
    }
}
