//! The token definition for the filter language.
//!
//! A parse produces a tree of [`Token`]s. Each token carries its grammar
//! symbol, an optional textual value, a typed payload for values and its
//! children in source order.

use std::fmt;

/// The grammar symbol of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Logical groups
    And,
    Or,

    // Clause parts
    Clause,
    Alias,
    JsonSelector,
    Operator,

    // Values
    List,
    Value,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::And => "AND",
            TokenKind::Or => "OR",
            TokenKind::Clause => "CLAUSE",
            TokenKind::Alias => "ALIAS",
            TokenKind::JsonSelector => "JSONSEL",
            TokenKind::Operator => "OP",
            TokenKind::List => "LIST",
            TokenKind::Value => "VALUE",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The class of a parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value as typed by the filter parser.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl TypedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            TypedValue::Null => ValueKind::Null,
            TypedValue::Bool(_) => ValueKind::Boolean,
            TypedValue::Int(_) | TypedValue::Float(_) => ValueKind::Number,
            TypedValue::String(_) => ValueKind::String,
        }
    }

    /// Convert into the value type used for statement parameters.
    pub fn to_sql_value(&self) -> sea_query::Value {
        match self {
            TypedValue::Null => sea_query::Value::String(None),
            TypedValue::Bool(b) => sea_query::Value::Bool(Some(*b)),
            TypedValue::Int(n) => sea_query::Value::BigInt(Some(*n)),
            TypedValue::Float(n) => sea_query::Value::Double(Some(*n)),
            TypedValue::String(s) => sea_query::Value::String(Some(Box::new(s.clone()))),
        }
    }
}

/// Typed metadata attached to value tokens.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    /// The value was written inside double quotes.
    pub quoted: bool,
    pub typed_value: Option<TypedValue>,
}

/// A node of the parse tree, with its location in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: Option<String>,
    pub payload: Payload,
    pub children: Vec<Token>,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, start: usize) -> Self {
        Self {
            kind,
            value: None,
            payload: Payload::default(),
            children: Vec::new(),
            span: Span::new(start, start),
        }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn push_char(&mut self, c: char) {
        self.value.get_or_insert_with(String::new).push(c);
    }

    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    pub fn add(&mut self, child: Token) {
        self.children.push(child);
    }

    pub fn child(&self, kind: TokenKind) -> Option<&Token> {
        self.children.iter().find(|c| c.kind == kind)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// The class of a value token, `None` for structural tokens.
    pub fn value_kind(&self) -> Option<ValueKind> {
        self.payload.typed_value.as_ref().map(TypedValue::kind)
    }

    pub fn typed_value(&self) -> Option<&TypedValue> {
        self.payload.typed_value.as_ref()
    }

    /// The list or single value of a clause token.
    pub fn clause_values(&self) -> Option<&Token> {
        self.children
            .iter()
            .find(|c| matches!(c.kind, TokenKind::List | TokenKind::Value))
    }

    /// Number of values of a clause: list length, or 1 for a scalar.
    pub fn clause_arity(&self) -> usize {
        match self.clause_values() {
            Some(t) if t.is(TokenKind::List) => t.child_count(),
            Some(_) => 1,
            None => 0,
        }
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
