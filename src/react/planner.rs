//! Planner：每轮选择一个 instrument 及其参数
//!
//! 模型回复须为 `{"instrument_name": ..., "instrument_args": ...}`；允许 ```json 围栏或前后散文，
//! 取最外层 `{…}` 解析。instrument_args 可以是对象，也可以是 `[{"name","value"}]` 列表，
//! 两种形式统一为 PlanArgs；列表中重名时后者覆盖前者。

use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::{AgentError, RequestState};
use crate::llm::LlmClient;
use crate::observability::preview;
use crate::react::prompts;

/// 模型输出格式（用于解析与 Schema 生成）
#[derive(Debug, Deserialize, JsonSchema)]
struct PlanFormat {
    /// rag_retrieve | draft_answer | elevate | ask_user
    instrument_name: String,
    /// 参数对象，或 [{"name": ..., "value": ...}] 列表
    #[serde(default)]
    instrument_args: Option<ArgsFormat>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(untagged)]
enum ArgsFormat {
    Map(Map<String, Value>),
    Pairs(Vec<ArgPair>),
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ArgPair {
    name: String,
    #[serde(default)]
    value: Value,
}

/// 返回 Plan 格式的 JSON Schema 字符串，拼入 Planner 的 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 归一化后的参数表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanArgs(Map<String, Value>);

impl PlanArgs {
    fn from_format(args: Option<ArgsFormat>) -> Self {
        match args {
            None => Self::default(),
            Some(ArgsFormat::Map(map)) => Self(map),
            Some(ArgsFormat::Pairs(pairs)) => {
                let mut map = Map::new();
                for pair in pairs {
                    map.insert(pair.name, pair.value);
                }
                Self(map)
            }
        }
    }

    /// 可选字符串参数；null 视为缺省
    fn string(&self, instrument: &str, key: &str) -> Result<Option<String>, AgentError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(AgentError::ProtocolError(format!(
                "{}.{} must be a string, got {}",
                instrument, key, other
            ))),
        }
    }

    /// 可选非负整数参数；接受 5 或 5.0，拒绝负数、小数与字符串
    fn non_negative_int(&self, instrument: &str, key: &str) -> Result<Option<usize>, AgentError> {
        let value = match self.0.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(v) => v,
        };
        if let Some(n) = value.as_u64() {
            return Ok(Some(n as usize));
        }
        match value.as_f64() {
            Some(f) if f >= 0.0 && f.fract() == 0.0 && f.is_finite() => Ok(Some(f as usize)),
            _ => Err(AgentError::ProtocolError(format!(
                "{}.{} must be a non-negative integer, got {}",
                instrument, key, value
            ))),
        }
    }

    pub fn preview(&self, max_chars: usize) -> String {
        preview(&Value::Object(self.0.clone()).to_string(), max_chars)
    }
}

/// 封闭的 instrument 集合；其它名称为 Unknown（不终止循环的空操作）
#[derive(Debug, Clone, PartialEq)]
pub enum Instrument {
    RagRetrieve {
        query: Option<String>,
        top_k: Option<usize>,
    },
    DraftAnswer {
        content: Option<String>,
    },
    Elevate {
        reason: Option<String>,
    },
    AskUser {
        question: Option<String>,
    },
    Unknown(String),
}

pub const RAG_RETRIEVE: &str = "rag_retrieve";
pub const DRAFT_ANSWER: &str = "draft_answer";
pub const ELEVATE: &str = "elevate";
pub const ASK_USER: &str = "ask_user";

impl Instrument {
    pub fn name(&self) -> &str {
        match self {
            Instrument::RagRetrieve { .. } => RAG_RETRIEVE,
            Instrument::DraftAnswer { .. } => DRAFT_ANSWER,
            Instrument::Elevate { .. } => ELEVATE,
            Instrument::AskUser { .. } => ASK_USER,
            Instrument::Unknown(name) => name,
        }
    }

    fn from_parts(name: &str, args: &PlanArgs) -> Result<Self, AgentError> {
        let normalized = normalize_name(name);
        let instrument = match normalized.as_str() {
            RAG_RETRIEVE => Instrument::RagRetrieve {
                query: args.string(RAG_RETRIEVE, "query")?,
                top_k: args.non_negative_int(RAG_RETRIEVE, "top_k")?,
            },
            DRAFT_ANSWER => Instrument::DraftAnswer {
                content: args.string(DRAFT_ANSWER, "content")?,
            },
            ELEVATE => Instrument::Elevate {
                reason: args.string(ELEVATE, "reason")?,
            },
            ASK_USER => Instrument::AskUser {
                question: args.string(ASK_USER, "question")?,
            },
            _ => Instrument::Unknown(normalized),
        };
        Ok(instrument)
    }
}

/// 一轮规划结果
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub instrument: Instrument,
    pub args: PlanArgs,
}

/// 去首尾空白、小写、空白串与连字符替换为下划线
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace('-', "_")
}

/// 从模型回复中取最外层 JSON 对象并解析为 Plan
pub fn parse_plan(output: &str) -> Result<Plan, AgentError> {
    let trimmed = output.trim();
    let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(AgentError::ProtocolError(format!(
                "no JSON object in planner output: {}",
                preview(trimmed, 200)
            )))
        }
    };

    let format: PlanFormat = serde_json::from_str(json_str).map_err(|e| {
        AgentError::ProtocolError(format!("{}: {}", e, preview(json_str, 200)))
    })?;
    let args = PlanArgs::from_format(format.instrument_args);
    let instrument = Instrument::from_parts(&format.instrument_name, &args)?;
    Ok(Plan { instrument, args })
}

/// Planner：持有 LLM，plan(state, unavailable) 构造提示、调用模型并解析
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn plan(&self, state: &RequestState, unavailable: &[&str]) -> Result<Plan, AgentError> {
        let messages = prompts::planner_messages(state, unavailable);
        let output = self.llm.complete(&messages).await?;
        let plan = parse_plan(&output)?;
        tracing::info!(
            request_id = %state.request_id,
            instrument = plan.instrument.name(),
            args = %plan.args.preview(200),
            "planner selected instrument"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_map_args() {
        let plan = parse_plan(
            r#"{"instrument_name": "rag_retrieve", "instrument_args": {"query": "refund", "top_k": 5}}"#,
        )
        .unwrap();
        assert_eq!(
            plan.instrument,
            Instrument::RagRetrieve {
                query: Some("refund".to_string()),
                top_k: Some(5)
            }
        );
    }

    #[test]
    fn test_parse_pair_list_later_duplicate_wins() {
        let plan = parse_plan(
            r#"{"instrument_name":"rag_retrieve","instrument_args":[{"name":"query","value":"a"},{"name":"top_k","value":2},{"name":"query","value":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(
            plan.instrument,
            Instrument::RagRetrieve {
                query: Some("b".to_string()),
                top_k: Some(2)
            }
        );
    }

    #[test]
    fn test_parse_fenced_output_and_name_normalization() {
        let out = "Sure.\n```json\n{\"instrument_name\": \"  Draft Answer \"}\n```";
        let plan = parse_plan(out).unwrap();
        assert_eq!(plan.instrument, Instrument::DraftAnswer { content: None });

        let plan = parse_plan(r#"{"instrument_name": "ASK-USER", "instrument_args": null}"#).unwrap();
        assert_eq!(plan.instrument, Instrument::AskUser { question: None });
    }

    #[test]
    fn test_unknown_instrument() {
        let plan = parse_plan(r#"{"instrument_name": "Search Web", "instrument_args": {}}"#).unwrap();
        assert_eq!(plan.instrument, Instrument::Unknown("search_web".to_string()));
        assert_eq!(plan.instrument.name(), "search_web");
    }

    #[test]
    fn test_protocol_errors() {
        let cases = [
            "not json at all",
            r#"{"instrument_args": {}}"#,
            r#"{"instrument_name": "rag_retrieve", "instrument_args": "query"}"#,
            r#"{"instrument_name": "rag_retrieve", "instrument_args": {"top_k": -1}}"#,
            r#"{"instrument_name": "rag_retrieve", "instrument_args": {"top_k": "3"}}"#,
            r#"{"instrument_name": "draft_answer", "instrument_args": {"content": 42}}"#,
        ];
        for case in cases {
            let err = parse_plan(case).unwrap_err();
            assert!(matches!(err, AgentError::ProtocolError(_)), "case: {}", case);
        }
    }

    #[test]
    fn test_unrecognized_args_ignored() {
        let plan = parse_plan(
            r#"{"instrument_name": "elevate", "instrument_args": {"reason": "refund", "priority": 1}}"#,
        )
        .unwrap();
        assert_eq!(
            plan.instrument,
            Instrument::Elevate {
                reason: Some("refund".to_string())
            }
        );
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = plan_schema_json();
        assert!(schema.contains("instrument_name"));
        assert!(schema.contains("instrument_args"));
    }

    #[tokio::test]
    async fn test_planner_calls_llm() {
        let mock = Arc::new(
            MockLlmClient::new().with_response(r#"{"instrument_name": "elevate", "instrument_args": {}}"#),
        );
        let planner = Planner::new(mock.clone());
        let state = RequestState::new("r1", "I want a human");
        let plan = planner.plan(&state, &[]).await.unwrap();
        assert_eq!(plan.instrument, Instrument::Elevate { reason: None });
        assert_eq!(mock.call_count(), 1);
    }
}
