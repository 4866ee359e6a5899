//! ReAct 主循环
//!
//! Plan -> Act (Dispatcher) -> Observe，至多 max_iterations 轮；终止类 instrument 立即退出。
//! 步数耗尽时生成强制草稿（审计为 ForcedDraft），随后按 finalize_required 决定是否走 Finalizer。
//!
//! 每轮审计：Plan + instrument（+ Observation，仅当工具实际执行）。被拦截的 ask_user 记入
//! 循环内的不可用列表并告知 Planner，检索得到证据后解除。

use crate::core::{AgentError, RequestState};
use crate::observability::preview;
use crate::react::dispatcher::{DispatchStatus, Dispatcher};
use crate::react::finalizer::Finalizer;
use crate::react::observer::ObservationSummarizer;
use crate::react::planner::{Instrument, Planner, ASK_USER};

/// 默认最大规划轮数
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
/// 审计摘要默认最大字符数
pub const DEFAULT_SUMMARY_CHARS: usize = 120;

/// 单次请求的循环结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReactResult {
    pub message: String,
    pub support_needed: bool,
}

/// ReAct 会话配置：循环所需的各组件引用
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub dispatcher: &'a Dispatcher,
    pub observer: &'a ObservationSummarizer,
    pub finalizer: &'a Finalizer,
    pub max_iterations: usize,
    pub summary_chars: usize,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        planner: &'a Planner,
        dispatcher: &'a Dispatcher,
        observer: &'a ObservationSummarizer,
        finalizer: &'a Finalizer,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            observer,
            finalizer,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            summary_chars: DEFAULT_SUMMARY_CHARS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_summary_chars(mut self, summary_chars: usize) -> Self {
        self.summary_chars = summary_chars;
        self
    }
}

/// 执行 ReAct 循环并返回最终回复
pub async fn react_loop(session: &ReactSession<'_>, state: &mut RequestState) -> Result<ReactResult, AgentError> {
    tracing::info!(request_id = %state.request_id, "starting ReAct loop");

    let mut unavailable: Vec<&str> = Vec::new();
    let mut terminated = false;

    for iteration in 1..=session.max_iterations {
        if state.is_grounded() {
            unavailable.retain(|name| *name != ASK_USER);
        }

        let plan = session.planner.plan(state, &unavailable).await?;
        state.record_step(
            "Plan",
            format!("iteration={}", iteration),
            format!("instrument={}", plan.instrument.name()),
        );

        let outcome = session.dispatcher.dispatch(&plan.instrument, state).await?;
        let name = plan.instrument.name().to_string();
        state.record_step(
            name.clone(),
            preview(&outcome.input_summary, session.summary_chars),
            preview(&outcome.output_summary, session.summary_chars),
        );

        match outcome.status {
            DispatchStatus::Executed => {
                let thought = session.observer.summarize(&name, &outcome.output).await?;
                let length = thought.chars().count();
                state.push_thought(thought);
                state.record_step(
                    "Observation",
                    format!("instrument={}", name),
                    format!("thought_length={}", length),
                );
            }
            DispatchStatus::Blocked => {
                if matches!(plan.instrument, Instrument::AskUser { .. }) && !unavailable.contains(&ASK_USER) {
                    unavailable.push(ASK_USER);
                }
            }
            DispatchStatus::Unrecognized => {}
        }

        if outcome.terminal {
            terminated = true;
            break;
        }
    }

    if !terminated {
        tracing::warn!(
            request_id = %state.request_id,
            max_iterations = session.max_iterations,
            "iteration budget exhausted, forcing a draft"
        );
        let draft = session.dispatcher.force_draft(state).await?;
        state.record_step(
            "ForcedDraft",
            format!("evidence_items={}", state.evidence().len()),
            format!("draft_length={}", draft.chars().count()),
        );
    }

    let message = if state.finalize_required() {
        session.finalizer.finalize(state).await?
    } else {
        state.answer_draft().unwrap_or_default().to_string()
    };

    Ok(ReactResult {
        message,
        support_needed: state.support_needed(),
    })
}
