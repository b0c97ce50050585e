//! 过滤语言的解析框架
//!
//! `Lexer` 在不可变的输入字符串上维护一个游标，提供字符级的匹配原语，
//! 以及两个构建 [`Token`] 的组合子：
//!
//! - [`Lexer::match_while`]：反复调用 `step`，每次调用最多向 token 的值追加一个字符；
//! - [`Lexer::match_once`]：只调用一次 `step`，用于添加子节点或设置元数据。
//!
//! 所有错误都以 [`ParseError`] 返回，位置为字节偏移。

use crate::token::{Token, TokenKind};

/// 语法错误：位置、出错处的输入以及期望的内容
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error at position {position}: {expected} expected, found {found}")]
pub struct ParseError {
    /// 字节偏移
    pub position: usize,
    pub found: String,
    pub expected: String,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// 游标位置的快照，用于回退
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

pub struct Lexer<'a> {
    input: &'a str,
    /// (字节偏移, 字符)
    chars: Vec<(usize, char)>,
    /// 当前位置（字符索引）
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            chars: input.char_indices().collect(),
            position: 0,
        }
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    /// 当前位置的字节偏移
    pub fn offset(&self) -> usize {
        self.chars
            .get(self.position)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.input.len())
    }

    /// 返回当前位置的字符，到达输入末尾时返回 `None`
    pub fn current(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    /// 相对当前位置偏移 `n` 个字符查看（可以为负）
    pub fn lookahead(&self, n: isize) -> Option<char> {
        let index = self.position as isize + n;
        if index < 0 {
            return None;
        }
        self.chars.get(index as usize).map(|(_, c)| *c)
    }

    pub fn is_eol(&self) -> bool {
        self.position >= self.chars.len()
    }

    /// 推进位置一个字符并返回该字符
    pub fn bump(&mut self) -> Option<char> {
        let c = self.current();
        if c.is_some() {
            self.position += 1;
        }
        c
    }

    pub fn is(&self, c: char) -> bool {
        self.current() == Some(c)
    }

    /// 如果当前字符是 `c` 则消费它
    pub fn consume(&mut self, c: char) -> bool {
        if self.is(c) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// 如果输入从当前位置开始是 `s` 则整体消费
    pub fn consume_str(&mut self, s: &str) -> bool {
        let count = s.chars().count();
        let matches = self.position + count <= self.chars.len()
            && self.chars[self.position..self.position + count]
                .iter()
                .map(|(_, c)| *c)
                .eq(s.chars());
        if matches {
            self.position += count;
        }
        matches
    }

    /// 否定前瞻：当前字符不是 `c` 时返回 true
    pub fn clash(&self, c: char) -> bool {
        !self.is(c)
    }

    /// 当前字符必须属于 `set`
    pub fn expect(&self, set: &str) -> ParseResult<()> {
        match self.current() {
            Some(c) if set.contains(c) => Ok(()),
            _ => Err(self.error(describe_set(set, false))),
        }
    }

    /// 当前字符必须属于 `set`，或者已到达输入末尾
    pub fn expect_end_or(&self, set: &str) -> ParseResult<()> {
        match self.current() {
            None => Ok(()),
            Some(c) if set.contains(c) => Ok(()),
            Some(_) => Err(self.error(describe_set(set, true))),
        }
    }

    pub fn expect_end(&self) -> ParseResult<()> {
        self.expect_end_or("")
    }

    /// 当前字符必须是 `c`，并消费它
    pub fn expect_consume(&mut self, c: char) -> ParseResult<()> {
        let mut buf = [0u8; 4];
        self.expect(c.encode_utf8(&mut buf))?;
        self.position += 1;
        Ok(())
    }

    /// 在当前位置构造一个语法错误
    pub fn error(&self, expected: impl Into<String>) -> ParseError {
        ParseError {
            position: self.offset(),
            found: match self.current() {
                Some(c) => format!("'{}'", c),
                None => "end of input".to_string(),
            },
            expected: expected.into(),
        }
    }

    pub fn mark(&self) -> Mark {
        Mark(self.position)
    }

    pub fn reset(&mut self, mark: Mark) {
        self.position = mark.0.min(self.chars.len());
    }

    /// 前进 `n` 个字符（不超过输入末尾）
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.chars.len());
    }

    /// 反复调用 `step`，直到它返回 false
    pub fn match_while<F>(&mut self, kind: TokenKind, mut step: F) -> ParseResult<Token>
    where
        F: FnMut(&mut Self, &mut Token) -> ParseResult<bool>,
    {
        let mut token = Token::new(kind, self.offset());
        while step(self, &mut token)? {}
        token.span.end = self.offset();
        Ok(token)
    }

    /// 只调用一次 `step`
    pub fn match_once<F>(&mut self, kind: TokenKind, step: F) -> ParseResult<Token>
    where
        F: FnOnce(&mut Self, &mut Token) -> ParseResult<()>,
    {
        let mut token = Token::new(kind, self.offset());
        step(self, &mut token)?;
        token.span.end = self.offset();
        Ok(token)
    }
}

fn describe_set(set: &str, or_end: bool) -> String {
    let mut parts: Vec<String> = set.chars().map(|c| format!("'{}'", c)).collect();
    if or_end {
        parts.push("end of input".to_string());
    }
    match parts.len() {
        0 => "nothing".to_string(),
        1 => parts.remove(0),
        _ => format!("one of {}", parts.join(", ")),
    }
}
