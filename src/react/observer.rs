//! Observation Summarizer：把工具原始输出压缩为 1–4 条事实要点，写入 thoughts 供下一轮 Planner 使用

use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::react::prompts;

pub struct ObservationSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl ObservationSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn summarize(&self, instrument: &str, tool_output: &str) -> Result<String, AgentError> {
        let messages = prompts::observation_messages(instrument, tool_output);
        let thought = self.llm.complete(&messages).await?.trim().to_string();
        tracing::debug!(instrument, length = thought.chars().count(), "recorded observation");
        Ok(thought)
    }
}
