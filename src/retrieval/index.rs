//! 进程内向量索引
//!
//! 知识库目录（.md / .txt）→ 分块 → 批量嵌入 → 余弦检索。
//! SharedIndex 在首次检索时构建一次，之后所有请求只读共享。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use walkdir::WalkDir;

use crate::llm::embedding::{align_embeddings, cosine_similarity};
use crate::llm::EmbeddingProvider;
use crate::retrieval::chunker::Chunker;
use crate::retrieval::retriever::{RetrievalError, RetrievedChunk, Retriever};

const EMBED_BATCH: usize = 32;

/// 已嵌入的片段
#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: RetrievedChunk,
    embedding: Vec<f32>,
}

/// 内存向量索引
#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: Vec<IndexedChunk>,
}

impl VectorIndex {
    /// 从 (doc_id, 全文) 列表构建；chunk_id 为全局递增序号
    pub async fn build(
        documents: &[(String, String)],
        chunker: &Chunker,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Self, RetrievalError> {
        let mut chunks = Vec::new();
        for (doc_id, text) in documents {
            for (i, piece) in chunker.split(text).into_iter().enumerate() {
                let chunk = RetrievedChunk::new(chunks.len().to_string(), piece)
                    .with_metadata("doc_id", doc_id.clone())
                    .with_metadata("chunk_index", i);
                chunks.push(chunk);
            }
        }

        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = align_embeddings(embedder.embed(&texts).await?, texts.len());
            entries.extend(batch.iter().cloned().zip(vectors).map(|(chunk, embedding)| {
                IndexedChunk { chunk, embedding }
            }));
        }

        tracing::info!(
            documents = documents.len(),
            chunks = entries.len(),
            "vector index built"
        );
        Ok(Self { entries })
    }

    /// 扫描知识库目录并构建；文件按路径排序，保证 chunk_id 稳定
    pub async fn from_dir(
        dir: &Path,
        chunker: &Chunker,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Self, RetrievalError> {
        if !dir.is_dir() {
            return Err(RetrievalError::Index(format!(
                "knowledge base not found: {}",
                dir.display()
            )));
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "md" | "txt"))
            })
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                RetrievalError::Index(format!("failed to read {}: {}", path.display(), e))
            })?;
            let doc_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            documents.push((doc_id, text));
        }

        Self::build(&documents, chunker, embedder).await
    }

    /// 按余弦相似度取前 k 个；相同分数保持索引顺序
    pub fn search(&self, query_embedding: &[f32], k: usize) -> Vec<(RetrievedChunk, f32)> {
        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .entries
            .iter()
            .map(|e| (cosine_similarity(query_embedding, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(score, e)| (e.chunk.clone(), score))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 懒加载、跨请求共享的索引句柄：初始化串行，之后只读
pub struct SharedIndex {
    cell: OnceCell<Arc<VectorIndex>>,
    knowledge_base: PathBuf,
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SharedIndex {
    pub fn new(
        knowledge_base: impl Into<PathBuf>,
        chunker: Chunker,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            cell: OnceCell::new(),
            knowledge_base: knowledge_base.into(),
            chunker,
            embedder,
        }
    }

    /// 获取索引；构建失败不会缓存，下次调用重试
    pub async fn get(&self) -> Result<Arc<VectorIndex>, RetrievalError> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!(dir = %self.knowledge_base.display(), "building vector index");
                VectorIndex::from_dir(&self.knowledge_base, &self.chunker, self.embedder.as_ref())
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    pub fn is_built(&self) -> bool {
        self.cell.initialized()
    }
}

/// 基于 SharedIndex 的检索器
pub struct IndexRetriever {
    index: Arc<SharedIndex>,
}

impl IndexRetriever {
    pub fn new(index: Arc<SharedIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let index = self.index.get().await?;
        if index.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let vectors = self.index.embedder.embed(&[query.to_string()]).await?;
        let query_embedding = vectors.into_iter().next().unwrap_or_default();
        Ok(index
            .search(&query_embedding, top_k)
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect())
    }
}
