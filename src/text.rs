//! 文本预处理协作方：规整与实体抽取
//!
//! 核心只依赖 TextProcessor trait；BasicTextProcessor 提供空白 / 不可见字符规整，不做实体抽取。

use std::sync::OnceLock;

use regex::Regex;

/// 文本规整与 NER 的协作接口
pub trait TextProcessor: Send + Sync {
    fn normalize(&self, raw: &str) -> String;

    /// 返回平行数组 (names, types)，长度相同，可为空
    fn extract_entities(&self, text: &str) -> (Vec<String>, Vec<String>);
}

static SPACE_RUN_RE: OnceLock<Regex> = OnceLock::new();
static NEWLINE_RUN_RE: OnceLock<Regex> = OnceLock::new();

/// 默认实现：换行统一、空白类字符转空格、去零宽 / 方向控制字符、折叠连续空白
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicTextProcessor;

fn is_space_like(c: char) -> bool {
    matches!(
        c,
        '\u{00A0}' | '\u{1680}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}'
    )
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{00AD}' | '\u{FEFF}' | '\u{202A}'..='\u{202E}'
    )
}

impl TextProcessor for BasicTextProcessor {
    fn normalize(&self, raw: &str) -> String {
        let text = raw.replace("\r\n", "\n").replace('\r', "\n");
        let text: String = text
            .chars()
            .filter(|c| !is_invisible(*c))
            .map(|c| if is_space_like(c) { ' ' } else { c })
            .collect();

        let space_re = SPACE_RUN_RE.get_or_init(|| Regex::new(r"[ \t]{2,}").unwrap());
        let newline_re = NEWLINE_RUN_RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
        let text = space_re.replace_all(&text, " ");
        let text = newline_re.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    fn extract_entities(&self, _text: &str) -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace_and_controls() {
        let p = BasicTextProcessor;
        let raw = "  My\u{00A0}invoice\u{200B} shows\r\n\r\n\r\n\r\nthe   wrong amount ";
        assert_eq!(p.normalize(raw), "My invoice shows\n\nthe wrong amount");
    }

    #[test]
    fn test_no_entities() {
        let (names, types) = BasicTextProcessor.extract_entities("INV-42");
        assert!(names.is_empty() && types.is_empty());
    }
}
