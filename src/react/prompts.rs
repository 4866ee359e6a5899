//! 各阶段的 LLM 消息构造
//!
//! 每个函数返回 system + user 两条消息；user 为 JSON 负载。证据统一编号为 E1..En，
//! 草稿 / 定稿用 `[E#]` 引用。

use serde_json::{json, Value};

use crate::core::{EvidenceItem, RequestState};
use crate::memory::Message;
use crate::react::planner::plan_schema_json;

const PLANNER_SYSTEM: &str = "\
You are the Planner in a ReAct loop. Each turn, choose the single next instrument call that most \
efficiently advances the task. You do not execute tools; you only select the next call.

# INPUT
A JSON object with: user_request, chat_history, entities, thoughts (observations on executed \
steps), evidence_count, unavailable_instruments.

# INSTRUMENTS (pick exactly one)
- rag_retrieve: query:str, top_k:int. Search the knowledge base.
- draft_answer: content:str. Write the user-facing answer now from the evidence.
- elevate: reason:str. Hand the conversation over to a human support agent.
- ask_user: question:str. Ask one clarifying question. Only after retrieval returned evidence.

# POLICY
- Prefer the minimal action that unblocks the next step.
- Retrieve before answering unless the request needs no knowledge base facts.
- Elevate when the user asks for a human, or the request needs account actions you cannot perform.
- Never choose an instrument listed in unavailable_instruments.

# OUTPUT (STRICT)
Return only one JSON object: {\"instrument_name\": string, \"instrument_args\": object}. \
No prose, no markdown. Schema:
";

const REFORMULATE_SYSTEM: &str = "\
You are the Query Rewriter for a support knowledge base search. Rewrite the user query into \
alternative search queries that keep its meaning but vary wording and specificity.
Return only a JSON array of strings, no prose.";

const DRAFT_SYSTEM: &str = "\
You are the Drafter in a ReAct pipeline. Produce the user-facing message based only on the \
provided data. You do not call tools.
- If evidence is sufficient, give a concise, actionable answer.
- Use only the provided evidence; do not invent facts.
- Facts taken from evidence carry bracketed citations like [E2]. Do not fabricate ids.
- Reply in the user's language if it can be inferred, otherwise English.
- Return only the message text. No JSON, no preambles.";

const FORCE_DRAFT_SYSTEM: &str = "\
You are the Drafter in a ReAct pipeline and the step budget is exhausted. Write the best possible \
user-facing answer now from the evidence gathered so far. If evidence is thin, say what is known \
and what the user can do next.
- Facts taken from evidence carry bracketed citations like [E2].
- Return only the message text.";

const ELEVATE_SYSTEM: &str = "\
You are the Escalation Writer. The conversation is being handed over to a human support agent. \
Write a short, polite message telling the user that a specialist will take over, restating their \
issue in one sentence. Do not promise timelines. Return only the message text.";

const ASK_USER_SYSTEM: &str = "\
You are the Clarifier. Based on the request and the evidence found, ask the user exactly one \
crisp clarifying question that would let support resolve the issue. Return only the question.";

const OBSERVATION_SYSTEM: &str = "\
You are the Step Observer. Convert the tool output into short observations.
- 1 to 4 bullets maximum.
- Facts and findings only, no speculation.
- If helpful, suggest one minimal next step on a final line.
- No JSON.";

const FINALIZE_SYSTEM: &str = "\
You are the Finalizer. Produce the final user answer from the latest draft and the available \
evidence.
- Keep it clear and concise.
- Facts from evidence must carry citations [E#].
- Language: the user's language if detectable, otherwise English.
- Output only the final text (plain or Markdown).";

fn pair(system: impl Into<String>, payload: Value) -> Vec<Message> {
    vec![Message::system(system), Message::user(payload.to_string())]
}

/// 证据列表，id 为 E1..En（按证据追加顺序）
pub fn evidence_payload(evidence: &[EvidenceItem]) -> Vec<Value> {
    evidence
        .iter()
        .enumerate()
        .map(|(i, ev)| {
            json!({
                "id": format!("E{}", i + 1),
                "text": ev.text,
                "source": ev.doc_id,
                "score": ev.score,
            })
        })
        .collect()
}

pub fn planner_messages(state: &RequestState, unavailable: &[&str]) -> Vec<Message> {
    let system = format!("{}{}", PLANNER_SYSTEM, plan_schema_json());
    pair(
        system,
        json!({
            "user_request": state.norm_text,
            "chat_history": state.chat_history,
            "entities": state.entities,
            "thoughts": state.thoughts(),
            "evidence_count": state.evidence().len(),
            "unavailable_instruments": unavailable,
        }),
    )
}

pub fn reformulation_messages(query: &str, count: usize) -> Vec<Message> {
    pair(REFORMULATE_SYSTEM, json!({ "query": query, "count": count }))
}

fn drafting_payload(state: &RequestState, hint: Option<&str>) -> Value {
    json!({
        "user_request": state.norm_text,
        "entities": state.entities,
        "thoughts": state.thoughts(),
        "planner_hint": hint,
        "evidence_count": state.evidence().len(),
        "evidence": evidence_payload(state.evidence()),
    })
}

pub fn draft_messages(state: &RequestState, content_hint: Option<&str>) -> Vec<Message> {
    pair(DRAFT_SYSTEM, drafting_payload(state, content_hint))
}

pub fn force_draft_messages(state: &RequestState) -> Vec<Message> {
    pair(FORCE_DRAFT_SYSTEM, drafting_payload(state, None))
}

pub fn elevate_messages(state: &RequestState, reason: Option<&str>) -> Vec<Message> {
    pair(
        ELEVATE_SYSTEM,
        json!({
            "user_request": state.norm_text,
            "entities": state.entities,
            "reason": reason,
        }),
    )
}

pub fn ask_user_messages(state: &RequestState, question_hint: Option<&str>) -> Vec<Message> {
    pair(ASK_USER_SYSTEM, drafting_payload(state, question_hint))
}

pub fn observation_messages(instrument: &str, tool_output: &str) -> Vec<Message> {
    pair(
        OBSERVATION_SYSTEM,
        json!({ "instrument_name": instrument, "tool_output": tool_output }),
    )
}

pub fn finalize_messages(state: &RequestState) -> Vec<Message> {
    pair(
        FINALIZE_SYSTEM,
        json!({
            "user_request": state.norm_text,
            "entities": state.entities,
            "draft": state.latest_draft(),
            "evidence_count": state.evidence().len(),
            "evidence": evidence_payload(state.evidence()),
        }),
    )
}
