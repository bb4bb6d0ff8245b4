use std::io;

use unicode_normalization::UnicodeNormalization;

use crate::analysis::multi_reader::CharSource;

const READ_CHUNK: usize = 256;

/// 单个词项的最大长度（超出部分截断，防止异常输入撑爆 posting 表）
pub const MAX_TERM_CHARS: usize = 255;

/// 统一词项形态：NFC + 小写
pub fn normalize_term(term: &str) -> String {
    term.nfc().flat_map(char::to_lowercase).collect()
}

/// 流式分词：按字母数字切分，不把整个流读入内存
pub fn tokenize(src: &mut dyn CharSource) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_chars = 0usize;
    let mut buf = ['\0'; READ_CHUNK];

    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &c in &buf[..n] {
            if c.is_alphanumeric() {
                if cur_chars < MAX_TERM_CHARS {
                    cur.push(c);
                    cur_chars += 1;
                }
            } else if !cur.is_empty() {
                out.push(normalize_term(&cur));
                cur.clear();
                cur_chars = 0;
            }
        }
    }
    if !cur.is_empty() {
        out.push(normalize_term(&cur));
    }
    Ok(out)
}

/// 便捷版本：直接对 &str 分词
pub fn tokenize_str(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| normalize_term(&t.chars().take(MAX_TERM_CHARS).collect::<String>()))
        .collect()
}
