//! 证据聚合：查询改写 → 多路检索 → 按 chunk 去重 → 以原始查询重排 → top-K
//!
//! 改写失败退回原始查询；单路检索失败记录后跳过；重排失败向上传播。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::core::{AgentError, EvidenceItem};
use crate::llm::{LlmClient, Reranker};
use crate::react::prompts;
use crate::retrieval::retriever::{RetrievedChunk, Retriever};

static BULLET_RE: OnceLock<Regex> = OnceLock::new();

/// 聚合参数
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// 含原始查询在内的最多查询条数
    pub max_query_variants: usize,
    /// 每路检索的候选数（不少于 top_k）
    pub candidates_per_query: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_query_variants: 3,
            candidates_per_query: 8,
        }
    }
}

pub struct EvidenceAggregator {
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn Retriever>,
    reranker: Arc<dyn Reranker>,
    config: AggregatorConfig,
}

impl EvidenceAggregator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        retriever: Arc<dyn Retriever>,
        reranker: Arc<dyn Reranker>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            llm,
            retriever,
            reranker,
            config,
        }
    }

    /// 对 query 聚合出至多 top_k 条证据，按分数降序（同分保持入池顺序）
    pub async fn aggregate(&self, query: &str, top_k: usize) -> Result<Vec<EvidenceItem>, AgentError> {
        let original = query.trim();
        if original.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let variants = self.query_variants(original).await;
        let per_query = self.config.candidates_per_query.max(top_k);

        let mut pool: Vec<RetrievedChunk> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for variant in &variants {
            let chunks = match self.retriever.retrieve(variant, per_query).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!(query = %variant, error = %e, "retrieval failed for variant, skipping");
                    continue;
                }
            };
            for chunk in chunks {
                match positions.get(&chunk.chunk_id) {
                    Some(&i) => merge_metadata(&mut pool[i], chunk),
                    None => {
                        positions.insert(chunk.chunk_id.clone(), pool.len());
                        pool.push(chunk);
                    }
                }
            }
        }
        if pool.is_empty() {
            tracing::info!(variants = variants.len(), "no candidates retrieved");
            return Ok(Vec::new());
        }

        let documents: Vec<String> = pool.iter().map(|c| c.text.clone()).collect();
        let scores = self.reranker.rerank(original, &documents).await?;
        let scores = align_scores(scores, pool.len());

        let mut scored: Vec<(RetrievedChunk, f32)> = pool.into_iter().zip(scores).collect();
        // sort_by 为稳定排序
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        tracing::debug!(
            variants = variants.len(),
            evidence = scored.len(),
            "evidence aggregated"
        );
        Ok(scored
            .into_iter()
            .map(|(chunk, score)| to_evidence(chunk, score))
            .collect())
    }

    /// 原始查询 + 至多 max_query_variants-1 条改写；去空、大小写不敏感去重
    async fn query_variants(&self, original: &str) -> Vec<String> {
        let mut variants = vec![original.to_string()];
        let max = self.config.max_query_variants.max(1);
        if max == 1 {
            return variants;
        }

        let messages = prompts::reformulation_messages(original, max - 1);
        let reply = match self.llm.complete(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "query reformulation failed, using original query only");
                return variants;
            }
        };

        for candidate in parse_variants(&reply) {
            if variants.len() >= max {
                break;
            }
            let lowered = candidate.to_lowercase();
            if variants.iter().any(|v| v.to_lowercase() == lowered) {
                continue;
            }
            variants.push(candidate);
        }
        variants
    }
}

/// 改写结果：JSON 字符串数组，或每行一条（去掉项目符号 / 编号）
pub fn parse_variants(reply: &str) -> Vec<String> {
    let trimmed = reply.trim();
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
    }

    let bullet = BULLET_RE.get_or_init(|| Regex::new(r"^(?:[-*•]+|\d+[.)])\s*").unwrap());
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("```"))
        .map(|line| bullet.replace(line, "").trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 同一 chunk 的后续命中：只补充已有条目缺少的 metadata 键
fn merge_metadata(pooled: &mut RetrievedChunk, duplicate: RetrievedChunk) {
    for (key, value) in duplicate.metadata {
        pooled.metadata.entry(key).or_insert(value);
    }
}

/// 分数条数与文档数对齐：不足补 0，多余丢弃；非有限值记为 0
fn align_scores(mut scores: Vec<f32>, documents: usize) -> Vec<f32> {
    if scores.len() != documents {
        tracing::warn!(
            documents,
            scores = scores.len(),
            "reranker score count mismatch"
        );
        scores.resize(documents, 0.0);
    }
    for score in scores.iter_mut() {
        if !score.is_finite() {
            *score = 0.0;
        }
    }
    scores
}

/// doc_id 依次取 metadata 的 doc_id、source、file（字符串或数字），否则为 doc-<chunk_id>
fn to_evidence(chunk: RetrievedChunk, score: f32) -> EvidenceItem {
    let doc_id = ["doc_id", "source", "file"]
        .iter()
        .find_map(|key| match chunk.metadata.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("doc-{}", chunk.chunk_id));
    EvidenceItem {
        doc_id,
        chunk_id: chunk.chunk_id,
        text: chunk.text,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::retrieval::RetrievalError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 按查询返回预置结果，并记录收到的查询
    struct ScriptedRetriever {
        results: HashMap<String, Result<Vec<RetrievedChunk>, String>>,
        queries: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedRetriever {
        fn new(results: Vec<(&str, Result<Vec<RetrievedChunk>, String>)>) -> Self {
            Self {
                results: results.into_iter().map(|(q, r)| (q.to_string(), r)).collect(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Retriever for ScriptedRetriever {
        async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
            self.queries.lock().unwrap().push((query.to_string(), top_k));
            match self.results.get(query) {
                Some(Ok(chunks)) => Ok(chunks.clone()),
                Some(Err(msg)) => Err(RetrievalError::Request(msg.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    /// 分数取自文本中的关键词表
    struct TableReranker(Vec<(&'static str, f32)>);

    #[async_trait]
    impl Reranker for TableReranker {
        async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
            Ok(documents
                .iter()
                .map(|d| {
                    self.0
                        .iter()
                        .find(|(k, _)| d.contains(k))
                        .map(|(_, s)| *s)
                        .unwrap_or(0.0)
                })
                .collect())
        }
    }

    struct FixedReranker(Vec<f32>);

    #[async_trait]
    impl Reranker for FixedReranker {
        async fn rerank(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>, LlmError> {
            Ok(self.0.clone())
        }
    }

    fn chunk(id: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk::new(id, text)
    }

    fn aggregator(
        llm: MockLlmClient,
        retriever: ScriptedRetriever,
        reranker: impl Reranker + 'static,
    ) -> (EvidenceAggregator, Arc<ScriptedRetriever>) {
        let retriever = Arc::new(retriever);
        let agg = EvidenceAggregator::new(
            Arc::new(llm),
            retriever.clone(),
            Arc::new(reranker),
            AggregatorConfig::default(),
        );
        (agg, retriever)
    }

    #[tokio::test]
    async fn test_duplicate_chunk_across_variants_merges_metadata() {
        let llm = MockLlmClient::new().with_response(r#"["refund delay", "REFUND POLICY"]"#);
        let retriever = ScriptedRetriever::new(vec![
            (
                "refund policy",
                Ok(vec![chunk("7", "Refunds take 5 days").with_metadata("file", "billing.md")]),
            ),
            (
                "refund delay",
                Ok(vec![
                    chunk("7", "Refunds take 5 days (dup)")
                        .with_metadata("file", "other.md")
                        .with_metadata("section", "refunds"),
                    chunk("9", "Contact billing"),
                ]),
            ),
        ]);
        let (agg, retriever) = aggregator(
            llm,
            retriever,
            TableReranker(vec![("Refunds", 0.9), ("billing", 0.4)]),
        );

        let evidence = agg.aggregate("refund policy", 3).await.unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].chunk_id, "7");
        assert_eq!(evidence[0].text, "Refunds take 5 days");
        assert_eq!(evidence[0].doc_id, "billing.md");
        assert_eq!(evidence[1].doc_id, "doc-9");

        // 大小写重复的改写被丢弃，只检索两路
        let queries = retriever.queries.lock().unwrap().clone();
        assert_eq!(
            queries,
            vec![("refund policy".to_string(), 8), ("refund delay".to_string(), 8)]
        );
    }

    #[tokio::test]
    async fn test_stable_order_and_truncation() {
        let llm = MockLlmClient::new().with_error(LlmError::Timeout("slow".into()));
        let retriever = ScriptedRetriever::new(vec![(
            "q",
            Ok(vec![chunk("a", "one"), chunk("b", "two"), chunk("c", "three"), chunk("d", "four")]),
        )]);
        let (agg, _) = aggregator(llm, retriever, FixedReranker(vec![0.5, 0.9, 0.5, f32::NAN]));

        let evidence = agg.aggregate("q", 3).await.unwrap();
        let ids: Vec<&str> = evidence.iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(evidence.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_short_score_list_is_padded() {
        let llm = MockLlmClient::new().with_response("[]");
        let retriever = ScriptedRetriever::new(vec![(
            "q",
            Ok(vec![chunk("a", "one"), chunk("b", "two")]),
        )]);
        let (agg, _) = aggregator(llm, retriever, FixedReranker(vec![0.2]));

        let evidence = agg.aggregate("q", 5).await.unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[1].score, 0.0);
    }

    #[tokio::test]
    async fn test_failed_variant_is_skipped() {
        let llm = MockLlmClient::new().with_response("- alt query");
        let retriever = ScriptedRetriever::new(vec![
            ("q", Err("connection reset".to_string())),
            ("alt query", Ok(vec![chunk("1", "text")])),
        ]);
        let (agg, _) = aggregator(llm, retriever, FixedReranker(vec![0.3]));

        let evidence = agg.aggregate("q", 3).await.unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].chunk_id, "1");
    }

    #[tokio::test]
    async fn test_empty_query_and_empty_pool() {
        let (agg, retriever) = aggregator(
            MockLlmClient::new().with_response("[]"),
            ScriptedRetriever::new(vec![]),
            FixedReranker(vec![]),
        );
        assert!(agg.aggregate("   ", 3).await.unwrap().is_empty());
        assert!(retriever.queries.lock().unwrap().is_empty());
        assert!(agg.aggregate("nothing here", 3).await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_variants_formats() {
        assert_eq!(
            parse_variants("```json\n[\"a\", \" \", \"b\"]\n```"),
            vec!["a", "b"]
        );
        assert_eq!(
            parse_variants("1. first query\n2) second query\n- third\n\n• fourth"),
            vec!["first query", "second query", "third", "fourth"]
        );
    }

    #[test]
    fn test_doc_id_lookup_order() {
        let ev = to_evidence(
            chunk("3", "t").with_metadata("file", "f.md").with_metadata("source", 12),
            0.1,
        );
        assert_eq!(ev.doc_id, "12");
    }
}
