//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAGE__*` 覆盖（双下划线表示嵌套，如 `TRIAGE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub rerank: RerankSection,
    pub retrieval: RetrievalSection,
    pub agent: AgentSection,
}

/// [llm] 段：对话模型后端、采样参数、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点，含 HF router）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时回退到 HF_API_TOKEN / OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// 单次调用超时（秒）
    pub timeout_secs: u64,
    /// 超时后的最大尝试次数（含首次）
    pub max_retries: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "Qwen/Qwen3-8B:nscale".to_string(),
            base_url: Some("https://router.huggingface.co".to_string()),
            api_key: None,
            temperature: 0.7,
            max_tokens: None,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl LlmSection {
    /// 解析 API Key：配置优先，其次 HF_API_TOKEN、OPENAI_API_KEY；空串视为未设置
    pub fn resolve_api_key(&self) -> Option<String> {
        let non_empty = |k: &String| !k.trim().is_empty();
        self.api_key
            .clone()
            .filter(non_empty)
            .or_else(|| std::env::var("HF_API_TOKEN").ok().filter(non_empty))
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(non_empty))
    }
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    /// 未设置时与 [llm].base_url 相同
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: "intfloat/multilingual-e5-small".to_string(),
            base_url: None,
            timeout_secs: 60,
        }
    }
}

/// [rerank] 段：embedding（余弦相似度）或 http（外部重排服务）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerankSection {
    pub backend: String,
    pub url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for RerankSection {
    fn default() -> Self {
        Self {
            backend: "embedding".to_string(),
            url: None,
            model: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            timeout_secs: 60,
        }
    }
}

impl RerankSection {
    /// 外部重排端点：显式 url 优先，否则按 HF 推理路由拼出 `<base>/models/<model>`
    pub fn endpoint(&self, llm_base_url: Option<&str>) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let base = llm_base_url
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "https://router.huggingface.co".to_string());
        format!("{}/models/{}", base, self.model)
    }
}

/// [retrieval] 段：index（本地向量索引）或 http（外部检索服务）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub backend: String,
    /// 本地知识库目录（.md / .txt）
    pub knowledge_base: PathBuf,
    pub url: Option<String>,
    /// 每个查询变体召回的候选数（不少于 top_k）
    pub candidates_per_query: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub timeout_secs: u64,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            backend: "index".to_string(),
            knowledge_base: PathBuf::from("knowledge_base"),
            url: None,
            candidates_per_query: 8,
            chunk_size: 800,
            chunk_overlap: 200,
            timeout_secs: 30,
        }
    }
}

/// [agent] 段：ReAct 循环预算与默认参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub default_top_k: usize,
    /// 查询变体总数上限（含原始查询）
    pub max_query_variants: usize,
    /// 审计摘要最大字符数
    pub summary_chars: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            default_top_k: 3,
            max_query_variants: 3,
            summary_chars: 120,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRIAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
