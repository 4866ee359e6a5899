//! 文档分块：段落优先，超长段落按句切分，仍超长时硬切；随后合并小块并加字符重叠
//!
//! 长度均按字符计（UTF-8 安全）。硬切窗口自带重叠，不参与后续合并与重叠。

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 相邻块之间的重叠（字符数）
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    /// chunk_size 须为正，chunk_overlap 须小于 chunk_size
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be positive".to_string());
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            ));
        }
        Ok(())
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 200,
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

/// 分块中间结果；continued 表示硬切的后续窗口（已含与前一窗口的重叠）
#[derive(Debug)]
struct Block {
    text: String,
    continued: bool,
}

impl Block {
    fn plain(text: String) -> Self {
        Self { text, continued: false }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 在 `.` `!` `?` 后的空白处断句，空白本身丢弃
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = paragraph.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 将文档分割为块
    pub fn split(&self, text: &str) -> Vec<String> {
        let size = self.config.chunk_size.max(1);
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let chunks = self.split_paragraphs(text, size);
        let merged = merge_small(chunks, size);
        self.apply_overlap(merged)
    }

    fn split_paragraphs(&self, text: &str, size: usize) -> Vec<Block> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for p in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if char_len(&current) + 1 + char_len(p) <= size {
                if current.is_empty() {
                    current = p.to_string();
                } else {
                    current = format!("{}\n\n{}", current, p);
                }
                continue;
            }
            if !current.is_empty() {
                chunks.push(Block::plain(std::mem::take(&mut current)));
            }
            if char_len(p) > size {
                self.split_long_paragraph(p, size, &mut chunks);
            } else {
                current = p.to_string();
            }
        }
        if !current.is_empty() {
            chunks.push(Block::plain(current));
        }
        chunks
    }

    fn split_long_paragraph(&self, paragraph: &str, size: usize, chunks: &mut Vec<Block>) {
        let step = size.saturating_sub(self.config.chunk_overlap).max(1);
        let mut current = String::new();

        for s in split_sentences(paragraph) {
            if char_len(&current) + 1 + char_len(&s) <= size {
                if current.is_empty() {
                    current = s;
                } else {
                    current = format!("{} {}", current, s).trim().to_string();
                }
                continue;
            }
            if !current.is_empty() {
                chunks.push(Block::plain(std::mem::take(&mut current)));
            }
            if char_len(&s) > size {
                // 硬切：窗口 size，步长 size - overlap，末窗口到达结尾即停
                let chars: Vec<char> = s.chars().collect();
                let mut start = 0;
                loop {
                    let end = (start + size).min(chars.len());
                    chunks.push(Block {
                        text: chars[start..end].iter().collect(),
                        continued: start > 0,
                    });
                    if end == chars.len() {
                        break;
                    }
                    start += step;
                }
            } else {
                current = s;
            }
        }
        if !current.is_empty() {
            chunks.push(Block::plain(current));
        }
    }

    fn apply_overlap(&self, merged: Vec<Block>) -> Vec<String> {
        let overlap = self.config.chunk_overlap;
        let mut out: Vec<String> = Vec::with_capacity(merged.len());
        for block in merged {
            let next = match out.last() {
                Some(prev) if overlap > 0 && !block.continued => {
                    let prev_len = char_len(prev);
                    let tail: String = prev.chars().skip(prev_len.saturating_sub(overlap)).collect();
                    format!("{}\n\n{}", tail, block.text).trim().to_string()
                }
                _ => block.text,
            };
            out.push(next);
        }
        out
    }
}

/// 相邻小块在不超过 size 的前提下合并；硬切的后续窗口不被并入
fn merge_small(chunks: Vec<Block>, size: usize) -> Vec<Block> {
    let mut merged = Vec::with_capacity(chunks.len());
    let mut iter = chunks.into_iter().peekable();
    while let Some(mut block) = iter.next() {
        while char_len(&block.text) < size {
            match iter.peek() {
                Some(next) if !next.continued && char_len(&block.text) + 1 + char_len(&next.text) <= size => {
                    block.text.push_str("\n\n");
                    block.text.push_str(&next.text);
                    iter.next();
                }
                _ => break,
            }
        }
        merged.push(block);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        })
    }

    #[test]
    fn test_empty_text() {
        assert!(Chunker::default().split(" \r\n ").is_empty());
    }

    #[test]
    fn test_short_paragraphs_stay_together() {
        let chunks = chunker(100, 0).split("Refunds take 5 days.\r\n\r\nContact billing.");
        assert_eq!(chunks, vec!["Refunds take 5 days.\n\nContact billing."]);
    }

    #[test]
    fn test_paragraph_split_with_overlap() {
        let chunks = chunker(12, 4).split("aaaaaaaaaa\n\nbbbbbbbbbb");
        assert_eq!(chunks, vec!["aaaaaaaaaa", "aaaa\n\nbbbbbbbbbb"]);
    }

    #[test]
    fn test_long_paragraph_falls_back_to_sentences() {
        let chunks = chunker(20, 0).split("First sentence here. Second one is here. Third.");
        assert_eq!(
            chunks,
            vec!["First sentence here.", "Second one is here.", "Third."]
        );
    }

    #[test]
    fn test_hard_split_for_long_sentence() {
        let text = "x".repeat(25);
        let chunks = chunker(10, 0).split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| char_len(c) <= 10));
    }

    #[test]
    fn test_hard_split_windows_overlap_once() {
        let text = "x".repeat(25);
        let chunks = chunker(10, 4).split(&text);
        assert_eq!(chunks, vec!["x".repeat(10), "x".repeat(10), "x".repeat(10), "x".repeat(7)]);
        assert!(chunks.iter().all(|c| !c.contains('\n')));
    }

    #[test]
    fn test_hard_split_stops_at_end() {
        // 20 个字符、步长 5：最后一个窗口恰好覆盖结尾，不再产生多余尾窗
        let chunks = chunker(10, 5).split(&"y".repeat(20));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| char_len(c)).sum::<usize>(), 30);
    }

    #[test]
    fn test_paragraph_after_hard_split_gets_overlap() {
        let text = format!("{}\n\nshort", "z".repeat(12));
        let chunks = chunker(10, 3).split(&text);
        assert_eq!(chunks, vec!["z".repeat(10), "z".repeat(5), "zzz\n\nshort".to_string()]);
    }

    #[test]
    fn test_validate_rejects_overlap_not_below_size() {
        assert!(ChunkingConfig::default().validate().is_ok());
        let cfg = ChunkingConfig {
            chunk_size: 10,
            chunk_overlap: 20,
        };
        assert!(cfg.validate().is_err());
        let cfg = ChunkingConfig {
            chunk_size: 0,
            chunk_overlap: 0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "这是第一段话。".repeat(10);
        let chunks = chunker(16, 4).split(&text);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("Hi! How are you?  Fine."),
            vec!["Hi!", "How are you?", "Fine."]
        );
    }
}
