//! 过滤表达式的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse()
//!   └─ filter()                       根节点为隐式 AND
//!        └─ item() (',' item())*
//!             ├─ "and(" → group(AND) → item() (',' item())* ')'
//!             ├─ "or("  → group(OR)  → item() (',' item())* ')'
//!             └─ clause()
//!                  ├─ alias()          ALIAS
//!                  ├─ 期望 '.'
//!                  ├─ json_selector()  可选，带点号的路径
//!                  ├─ operator()       OPERATOR
//!                  ├─ 期望 '.'
//!                  └─ list_or_value()
//!                       ├─ '(' → list() → ')'
//!                       └─ value()
//! ```
//!
//! ## 支持的语法结构
//!
//! ```text
//! a.eq.5
//! a.in.(1,2,3)
//! and(a.eq.null,or(b.eq.5,c.re."^x"))
//! smetadata.address.city.eq.Bozen
//! ```
//!
//! ### 字面值类型（按顺序判断）
//! - **带引号**: 总是字符串
//! - **空值**: 空字符串 `""`
//! - **null**: 不区分大小写
//! - **布尔值**: `true` / `false`，不区分大小写
//! - **数字**: 先尝试整数，再尝试浮点数
//! - **其他**: 字符串，反斜杠转义下一个字符
//!
//! 未加引号的值中出现未转义的 `(`、`'`、`"` 是语法错误。

use crate::lexer::{Lexer, ParseError, ParseResult};
use crate::token::{Token, TokenKind, TypedValue};

pub struct FilterParser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> FilterParser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input),
        }
    }

    /// 解析完整的过滤表达式，返回根 AND 节点
    pub fn parse(mut self) -> Result<Token, ParseError> {
        filter(&mut self.lexer)
    }
}

/// 解析过滤表达式的便捷函数
pub fn parse_filter(input: &str) -> Result<Token, ParseError> {
    FilterParser::new(input).parse()
}

fn filter(lx: &mut Lexer) -> ParseResult<Token> {
    let root = lx.match_while(TokenKind::And, |lx, t| {
        t.add(item(lx)?);
        Ok(lx.consume(','))
    })?;
    lx.expect_end()?;
    Ok(root)
}

/// 逻辑分组或单个条件
fn item(lx: &mut Lexer) -> ParseResult<Token> {
    if lx.consume_str("and(") {
        group(lx, TokenKind::And)
    } else if lx.consume_str("or(") {
        group(lx, TokenKind::Or)
    } else {
        let clause = clause(lx)?;
        // 条件之后只能是 ',' ')' 或输入结束
        lx.expect_end_or(",)")?;
        Ok(clause)
    }
}

/// 分组的开括号已经被调用者消费
fn group(lx: &mut Lexer, kind: TokenKind) -> ParseResult<Token> {
    let token = lx.match_while(kind, |lx, t| {
        t.add(item(lx)?);
        Ok(lx.consume(','))
    })?;
    lx.expect_consume(')')?;
    Ok(token)
}

fn clause(lx: &mut Lexer) -> ParseResult<Token> {
    lx.match_once(TokenKind::Clause, |lx, t| {
        t.add(alias(lx)?);
        lx.expect_consume('.')?;
        if let Some(selector) = json_selector(lx)? {
            lx.expect_consume('.')?;
            t.add(selector);
        }
        t.add(operator(lx)?);
        lx.expect_consume('.')?;
        t.add(list_or_value(lx)?);
        Ok(())
    })
}

fn alias(lx: &mut Lexer) -> ParseResult<Token> {
    let token = lx.match_while(TokenKind::Alias, |lx, t| match lx.current() {
        Some(c) if c.is_alphabetic() || c == '_' => {
            t.push_char(c);
            lx.bump();
            Ok(true)
        }
        _ => Ok(false),
    })?;
    if token.value_str().is_empty() {
        return Err(lx.error("ALIAS"));
    }
    Ok(token)
}

fn operator(lx: &mut Lexer) -> ParseResult<Token> {
    let token = lx.match_while(TokenKind::Operator, |lx, t| match lx.current() {
        Some(c) if c.is_alphabetic() => {
            t.push_char(c);
            lx.bump();
            Ok(true)
        }
        _ => Ok(false),
    })?;
    if token.value_str().is_empty() {
        return Err(lx.error("OPERATOR"));
    }
    Ok(token)
}

/// JSON 选择器是可选的。
///
/// 先读取整段带点号的字符串，再从末尾去掉值和运算符两部分：
/// 值可能是带小数点的数字，此时需要再向前跳过一个点号。
/// 找到的位置就是选择器的结尾，其余部分退回给运算符和值的解析。
fn json_selector(lx: &mut Lexer) -> ParseResult<Option<Token>> {
    let mark = lx.mark();
    let mut token = lx.match_while(TokenKind::JsonSelector, |lx, t| match lx.current() {
        Some(c) if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') => {
            t.push_char(c);
            lx.bump();
            Ok(true)
        }
        _ => Ok(false),
    })?;
    let run = token.value.take().unwrap_or_default();
    lx.reset(mark);

    let Some(end) = selector_end(&run) else {
        return Ok(None);
    };
    lx.advance(run[..end].chars().count());
    token.value = Some(run[..end].to_string());
    token.span.end = lx.offset();
    Ok(Some(token))
}

/// 返回选择器结尾的字节位置（运算符前面的点号）
fn selector_end(run: &str) -> Option<usize> {
    let last = run.rfind('.')?;
    let mut index = run[..last].rfind('.')?;
    while run[index + 1..].parse::<f64>().is_ok() {
        index = run[..index].rfind('.')?;
    }
    Some(index)
}

fn list_or_value(lx: &mut Lexer) -> ParseResult<Token> {
    if lx.consume('(') {
        let list = list(lx)?;
        lx.expect_consume(')')?;
        Ok(list)
    } else {
        value(lx)
    }
}

/// 逗号分隔的值列表，允许为空 `()`
fn list(lx: &mut Lexer) -> ParseResult<Token> {
    lx.match_while(TokenKind::List, |lx, t| {
        if t.children.is_empty() && lx.is(')') {
            return Ok(false);
        }
        let value = value(lx)?;
        if !value.payload.quoted && value.value_str().is_empty() {
            return Err(lx.error("VALUE"));
        }
        t.add(value);
        Ok(lx.consume(','))
    })
}

fn value(lx: &mut Lexer) -> ParseResult<Token> {
    let start = lx.offset();
    let quoted = lx.consume('"');
    let mut token = lx.match_while(TokenKind::Value, |lx, t| {
        let Some(c) = lx.current() else {
            return Ok(false);
        };
        match c {
            '"' if quoted => Ok(false),
            ')' | ',' if !quoted => Ok(false),
            '(' | '\'' | '"' if !quoted => Err(lx.error("'\\' before '(', ''' or '\"'")),
            '\\' => match lx.lookahead(1) {
                Some(escaped) => {
                    t.push_char(escaped);
                    lx.advance(2);
                    Ok(true)
                }
                None => {
                    lx.bump();
                    Err(lx.error("escaped character"))
                }
            },
            _ => {
                t.push_char(c);
                lx.bump();
                Ok(true)
            }
        }
    })?;
    if quoted {
        lx.expect_consume('"')?;
    }

    let text = token.value.take().unwrap_or_default();
    let typed_value = if quoted {
        TypedValue::String(text.clone())
    } else {
        type_bare_value(&text)
    };
    token.value = Some(text);
    token.payload.quoted = quoted;
    token.payload.typed_value = Some(typed_value);
    token.span.start = start;
    token.span.end = lx.offset();
    Ok(token)
}

fn type_bare_value(text: &str) -> TypedValue {
    if text.is_empty() {
        return TypedValue::String(String::new());
    }
    if text.eq_ignore_ascii_case("null") {
        return TypedValue::Null;
    }
    if text.eq_ignore_ascii_case("true") {
        return TypedValue::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return TypedValue::Bool(false);
    }
    if let Ok(n) = text.parse::<i64>() {
        return TypedValue::Int(n);
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() => TypedValue::Float(f),
        // 其余情况保持字符串，类型转换错误交给数据库处理
        _ => TypedValue::String(text.to_string()),
    }
}
