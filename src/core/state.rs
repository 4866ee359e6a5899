//! 请求状态：单次请求内由 ReAct 循环独占的 RequestState
//!
//! 证据、审计、思考三个列表只追加不修改；三个布尔标志只能通过对应动作方法改变，
//! 保证 support_needed 仅在 elevate 之后为真、finalize_required 仅在 elevate / ask_user 之后为假。

use std::collections::HashSet;

use serde::Serialize;

use crate::memory::Message;

/// 实体（NER 锚点）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
        }
    }

    /// 由协作方返回的平行数组 (names, types) 构建；任一为空则无实体，长度不等时多余部分丢弃
    pub fn from_parallel(names: &[String], types: &[String]) -> Vec<Entity> {
        if names.is_empty() || types.is_empty() {
            return Vec::new();
        }
        names
            .iter()
            .zip(types.iter())
            .map(|(value, ty)| Entity::new(ty.clone(), value.clone()))
            .collect()
    }
}

/// 一条带分数的依据片段，创建后不可变
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvidenceItem {
    pub doc_id: String,
    pub chunk_id: String,
    pub text: String,
    /// 重排分数，越高越相关
    pub score: f32,
}

/// 审计记录（仅用于诊断，不参与控制流）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepAudit {
    /// 从 1 开始严格递增
    pub n: usize,
    pub tool: String,
    pub input_summary: String,
    pub output_summary: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestState {
    pub request_id: String,
    pub raw_text: String,
    pub norm_text: String,
    pub chat_history: Vec<Message>,
    pub entities: Vec<Entity>,
    evidence: Vec<EvidenceItem>,
    steps: Vec<StepAudit>,
    answer_draft: Option<String>,
    thoughts: Vec<String>,
    support_needed: bool,
    rag_used: bool,
    finalize_required: bool,
}

impl RequestState {
    pub fn new(request_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        Self {
            request_id: request_id.into(),
            norm_text: raw_text.clone(),
            raw_text,
            chat_history: Vec::new(),
            entities: Vec::new(),
            evidence: Vec::new(),
            steps: Vec::new(),
            answer_draft: None,
            thoughts: Vec::new(),
            support_needed: false,
            rag_used: false,
            finalize_required: true,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.chat_history = history;
        self
    }

    pub fn with_norm_text(mut self, norm_text: impl Into<String>) -> Self {
        self.norm_text = norm_text.into();
        self
    }

    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn steps(&self) -> &[StepAudit] {
        &self.steps
    }

    pub fn thoughts(&self) -> &[String] {
        &self.thoughts
    }

    pub fn answer_draft(&self) -> Option<&str> {
        self.answer_draft.as_deref()
    }

    pub fn support_needed(&self) -> bool {
        self.support_needed
    }

    pub fn rag_used(&self) -> bool {
        self.rag_used
    }

    pub fn finalize_required(&self) -> bool {
        self.finalize_required
    }

    /// ask_user 的前置条件：已做过有结果的检索且证据非空
    pub fn is_grounded(&self) -> bool {
        self.rag_used && !self.evidence.is_empty()
    }

    /// 追加一条审计记录，返回其序号
    pub fn record_step(
        &mut self,
        tool: impl Into<String>,
        input_summary: impl Into<String>,
        output_summary: impl Into<String>,
    ) -> usize {
        let n = self.steps.len() + 1;
        self.steps.push(StepAudit {
            n,
            tool: tool.into(),
            input_summary: input_summary.into(),
            output_summary: output_summary.into(),
        });
        n
    }

    /// 追加证据；已存在相同 chunk_id 的条目跳过。返回实际追加条数
    pub fn extend_evidence(&mut self, items: Vec<EvidenceItem>) -> usize {
        let mut seen: HashSet<String> = self.evidence.iter().map(|e| e.chunk_id.clone()).collect();
        let before = self.evidence.len();
        for item in items {
            if seen.insert(item.chunk_id.clone()) {
                self.evidence.push(item);
            }
        }
        self.evidence.len() - before
    }

    pub fn mark_rag_used(&mut self) {
        self.rag_used = true;
    }

    pub fn push_thought(&mut self, thought: impl Into<String>) {
        self.thoughts.push(thought.into());
    }

    /// draft_answer / 强制草稿：写入草稿并要求 Finalizer
    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.answer_draft = Some(draft.into());
        self.finalize_required = true;
    }

    /// elevate：写入移交说明，标记需要人工，跳过 Finalizer
    pub fn set_elevated(&mut self, handoff: impl Into<String>) {
        self.answer_draft = Some(handoff.into());
        self.support_needed = true;
        self.finalize_required = false;
    }

    /// ask_user：写入澄清问题，跳过 Finalizer
    pub fn set_question(&mut self, question: impl Into<String>) {
        self.answer_draft = Some(question.into());
        self.finalize_required = false;
    }

    /// Finalizer 使用的草稿：最新草稿，缺失时取最近一条思考
    pub fn latest_draft(&self) -> &str {
        self.answer_draft
            .as_deref()
            .or_else(|| self.thoughts.last().map(String::as_str))
            .unwrap_or("")
    }
}
