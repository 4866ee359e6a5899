//! Tool Dispatcher：把 Plan 中的 instrument 作用到 RequestState
//!
//! | instrument   | 前置条件              | 终止 |
//! |--------------|-----------------------|------|
//! | rag_retrieve | 无                    | 否   |
//! | draft_answer | 无                    | 是   |
//! | elevate      | 无                    | 是   |
//! | ask_user     | 已检索且证据非空      | 是   |
//!
//! ask_user 前置条件不满足、或 instrument 未知时不改动状态，只返回 Blocked / Unrecognized。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use crate::core::{AgentError, RequestState};
use crate::llm::LlmClient;
use crate::react::planner::Instrument;
use crate::react::prompts;
use crate::retrieval::EvidenceAggregator;

/// 本次分派的结果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// 工具实际执行，需要 Observation
    Executed,
    /// 策略拦截（ask_user 前置条件不满足）
    Blocked,
    /// 未知 instrument
    Unrecognized,
}

impl DispatchStatus {
    fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Executed => "ok",
            DispatchStatus::Blocked => "blocked",
            DispatchStatus::Unrecognized => "unrecognized",
        }
    }
}

/// 工具输出与审计摘要
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub status: DispatchStatus,
    /// 原始输出，供 Observation 使用
    pub output: String,
    pub input_summary: String,
    pub output_summary: String,
    /// 是否结束循环
    pub terminal: bool,
}

impl ToolOutcome {
    fn executed(output: String, input_summary: String, output_summary: String, terminal: bool) -> Self {
        Self {
            status: DispatchStatus::Executed,
            output,
            input_summary,
            output_summary,
            terminal,
        }
    }
}

pub struct Dispatcher {
    llm: Arc<dyn LlmClient>,
    aggregator: Arc<EvidenceAggregator>,
    default_top_k: usize,
}

impl Dispatcher {
    pub fn new(llm: Arc<dyn LlmClient>, aggregator: Arc<EvidenceAggregator>, default_top_k: usize) -> Self {
        Self {
            llm,
            aggregator,
            default_top_k: default_top_k.max(1),
        }
    }

    /// 执行 instrument；错误原样向上传播，并输出 JSON 审计日志
    pub async fn dispatch(
        &self,
        instrument: &Instrument,
        state: &mut RequestState,
    ) -> Result<ToolOutcome, AgentError> {
        let start = Instant::now();
        let result = self.run(instrument, state).await;

        let (ok, outcome, input_summary) = match &result {
            Ok(o) => (true, o.status.as_str(), o.input_summary.as_str()),
            Err(_) => (false, "error", ""),
        };
        let audit = serde_json::json!({
            "event": "instrument_audit",
            "request_id": state.request_id,
            "instrument": instrument.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "input_summary": input_summary,
        });
        tracing::info!(audit = %audit.to_string(), "instrument");

        result
    }

    async fn run(&self, instrument: &Instrument, state: &mut RequestState) -> Result<ToolOutcome, AgentError> {
        match instrument {
            Instrument::RagRetrieve { query, top_k } => {
                let query = query.clone().unwrap_or_else(|| state.norm_text.clone());
                let top_k = top_k.unwrap_or(self.default_top_k).max(1);
                let items = self.aggregator.aggregate(&query, top_k).await?;
                let returned = items.len();
                let output = if items.is_empty() {
                    "No evidence found.".to_string()
                } else {
                    items.iter().map(|e| e.text.as_str()).collect::<Vec<_>>().join("\n")
                };
                if returned > 0 {
                    state.mark_rag_used();
                }
                let added = state.extend_evidence(items);
                Ok(ToolOutcome::executed(
                    output,
                    format!("query_len={} top_k={}", query.chars().count(), top_k),
                    format!("evidence_items={} new={}", returned, added),
                    false,
                ))
            }
            Instrument::DraftAnswer { content } => {
                let messages = prompts::draft_messages(state, content.as_deref());
                let draft = self.llm.complete(&messages).await?.trim().to_string();
                tracing::info!(length = draft.chars().count(), "generated draft answer");
                state.set_draft(draft.clone());
                Ok(ToolOutcome::executed(
                    draft.clone(),
                    format!("evidence_items={}", state.evidence().len()),
                    format!("draft_length={}", draft.chars().count()),
                    true,
                ))
            }
            Instrument::Elevate { reason } => {
                let messages = prompts::elevate_messages(state, reason.as_deref());
                let handoff = self.llm.complete(&messages).await?.trim().to_string();
                tracing::info!(request_id = %state.request_id, "elevating to human support");
                state.set_elevated(handoff.clone());
                Ok(ToolOutcome::executed(
                    handoff.clone(),
                    format!("reason={}", reason.is_some()),
                    format!("handoff_length={}", handoff.chars().count()),
                    true,
                ))
            }
            Instrument::AskUser { question } => {
                if !state.is_grounded() {
                    tracing::info!(
                        rag_used = state.rag_used(),
                        evidence = state.evidence().len(),
                        "ask_user blocked: no grounded evidence yet"
                    );
                    return Ok(ToolOutcome {
                        status: DispatchStatus::Blocked,
                        output: String::new(),
                        input_summary: format!(
                            "blocked rag_used={} evidence_items={}",
                            state.rag_used(),
                            state.evidence().len()
                        ),
                        output_summary: "blocked".to_string(),
                        terminal: false,
                    });
                }
                let messages = prompts::ask_user_messages(state, question.as_deref());
                let asked = self.llm.complete(&messages).await?.trim().to_string();
                state.set_question(asked.clone());
                Ok(ToolOutcome::executed(
                    asked.clone(),
                    format!("evidence_items={}", state.evidence().len()),
                    format!("question_length={}", asked.chars().count()),
                    true,
                ))
            }
            Instrument::Unknown(name) => {
                tracing::warn!(instrument = %name, "unrecognized instrument");
                Ok(ToolOutcome {
                    status: DispatchStatus::Unrecognized,
                    output: String::new(),
                    input_summary: "unrecognized instrument".to_string(),
                    output_summary: format!("instrument={}", name),
                    terminal: false,
                })
            }
        }
    }

    /// 步数耗尽时根据已有证据与原始查询生成草稿（要求 Finalizer）
    pub async fn force_draft(&self, state: &mut RequestState) -> Result<String, AgentError> {
        let messages = prompts::force_draft_messages(state);
        let draft = self.llm.complete(&messages).await?.trim().to_string();
        tracing::info!(length = draft.chars().count(), "generated fallback draft answer");
        state.set_draft(draft.clone());
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, Reranker};
    use crate::retrieval::{AggregatorConfig, RetrievalError, RetrievedChunk, Retriever};
    use async_trait::async_trait;

    struct StaticRetriever(Vec<RetrievedChunk>);

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    struct FlatReranker;

    #[async_trait]
    impl Reranker for FlatReranker {
        async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
            Ok(vec![0.5; documents.len()])
        }
    }

    fn dispatcher(llm: MockLlmClient, chunks: Vec<RetrievedChunk>) -> Dispatcher {
        let llm: Arc<dyn LlmClient> = Arc::new(llm);
        let aggregator = EvidenceAggregator::new(
            llm.clone(),
            Arc::new(StaticRetriever(chunks)),
            Arc::new(FlatReranker),
            AggregatorConfig {
                max_query_variants: 1,
                candidates_per_query: 4,
            },
        );
        Dispatcher::new(llm, Arc::new(aggregator), 3)
    }

    #[tokio::test]
    async fn test_ask_user_blocked_leaves_state_unchanged() {
        let d = dispatcher(MockLlmClient::new(), vec![]);
        let mut state = RequestState::new("r1", "my invoice is wrong");
        let outcome = d
            .dispatch(&Instrument::AskUser { question: None }, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome.status, DispatchStatus::Blocked);
        assert!(!outcome.terminal);
        assert!(state.answer_draft().is_none());
        assert!(state.finalize_required());
        assert!(state.steps().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_then_ask_user() {
        let d = dispatcher(
            MockLlmClient::new().with_response("Which invoice number?"),
            vec![RetrievedChunk::new("7", "Invoices can be corrected within 30 days")],
        );
        let mut state = RequestState::new("r1", "my invoice is wrong");

        let outcome = d
            .dispatch(&Instrument::RagRetrieve { query: None, top_k: Some(0) }, &mut state)
            .await
            .unwrap();
        assert!(!outcome.terminal);
        assert_eq!(outcome.input_summary, "query_len=19 top_k=1");
        assert!(state.rag_used());
        assert_eq!(state.evidence().len(), 1);

        let outcome = d
            .dispatch(&Instrument::AskUser { question: None }, &mut state)
            .await
            .unwrap();
        assert!(outcome.terminal);
        assert_eq!(state.answer_draft(), Some("Which invoice number?"));
        assert!(!state.finalize_required());
        assert!(!state.support_needed());
    }

    #[tokio::test]
    async fn test_empty_retrieval_does_not_mark_rag_used() {
        let d = dispatcher(MockLlmClient::new(), vec![]);
        let mut state = RequestState::new("r1", "q");
        d.dispatch(&Instrument::RagRetrieve { query: None, top_k: None }, &mut state)
            .await
            .unwrap();
        assert!(!state.rag_used());
    }

    #[tokio::test]
    async fn test_elevate_and_unknown() {
        let d = dispatcher(MockLlmClient::new().with_response("A specialist will take over."), vec![]);
        let mut state = RequestState::new("r1", "talk to a human");

        let outcome = d
            .dispatch(&Instrument::Unknown("search_web".into()), &mut state)
            .await
            .unwrap();
        assert_eq!(outcome.status, DispatchStatus::Unrecognized);
        assert!(state.answer_draft().is_none());

        let outcome = d
            .dispatch(&Instrument::Elevate { reason: None }, &mut state)
            .await
            .unwrap();
        assert!(outcome.terminal);
        assert_eq!(outcome.output, "A specialist will take over.");
        assert!(state.support_needed());
        assert!(!state.finalize_required());
    }

    #[tokio::test]
    async fn test_llm_error_propagates() {
        let d = dispatcher(
            MockLlmClient::new().with_error(LlmError::Http { status: 401, body: "bad key".into() }),
            vec![],
        );
        let mut state = RequestState::new("r1", "q");
        let err = d
            .dispatch(&Instrument::DraftAnswer { content: None }, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmError(LlmError::Http { status: 401, .. })));
        assert!(state.answer_draft().is_none());
    }
}
