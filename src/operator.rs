//! Operator registry: (type class, operator name) → SQL template.
//!
//! Templates are parsed once at registration:
//!
//! - `%c` the column expression
//! - `%v` the whole value (scalar or list) as one parameter
//! - `%v[i]` list element `i`, or `null` when absent
//! - `%v[a:b]`, `%v[a:]`, `%v[:b]` a sub-list parameter
//! - `%%` a literal `%`

use crate::error::{QueryError, Result};
use crate::token::{Token, TokenKind, ValueKind};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The inferred category of a filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Null,
    Boolean,
    Number,
    String,
    ListNull,
    ListBoolean,
    ListNumber,
    ListString,
    ListMixed,
}

impl TypeClass {
    pub const ALL: [TypeClass; 9] = [
        TypeClass::Null,
        TypeClass::Boolean,
        TypeClass::Number,
        TypeClass::String,
        TypeClass::ListNull,
        TypeClass::ListBoolean,
        TypeClass::ListNumber,
        TypeClass::ListString,
        TypeClass::ListMixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeClass::Null => "null",
            TypeClass::Boolean => "boolean",
            TypeClass::Number => "number",
            TypeClass::String => "string",
            TypeClass::ListNull => "list/null",
            TypeClass::ListBoolean => "list/boolean",
            TypeClass::ListNumber => "list/number",
            TypeClass::ListString => "list/string",
            TypeClass::ListMixed => "list/mixed",
        }
    }

    pub fn scalar(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Null => TypeClass::Null,
            ValueKind::Boolean => TypeClass::Boolean,
            ValueKind::Number => TypeClass::Number,
            ValueKind::String => TypeClass::String,
        }
    }

    pub fn list_of(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Null => TypeClass::ListNull,
            ValueKind::Boolean => TypeClass::ListBoolean,
            ValueKind::Number => TypeClass::ListNumber,
            ValueKind::String => TypeClass::ListString,
        }
    }

    /// Infer the class of a `Value` or `List` token.
    ///
    /// Nulls inside a list do not decide its class; an empty or all-null
    /// list is `list/null`, differing non-null kinds give `list/mixed`.
    pub fn infer(values: &Token) -> Self {
        if !values.is(TokenKind::List) {
            return TypeClass::scalar(values.value_kind().unwrap_or(ValueKind::String));
        }
        let mut found: Option<ValueKind> = None;
        for kind in values.children.iter().filter_map(Token::value_kind) {
            match (found, kind) {
                (_, ValueKind::Null) => {}
                (None, k) => found = Some(k),
                (Some(f), k) if f == k => {}
                _ => return TypeClass::ListMixed,
            }
        }
        TypeClass::list_of(found.unwrap_or(ValueKind::Null))
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            TypeClass::ListNull
                | TypeClass::ListBoolean
                | TypeClass::ListNumber
                | TypeClass::ListString
                | TypeClass::ListMixed
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypeClass::Null | TypeClass::ListNull)
    }

    /// The scalar kind a class compares against, `None` for `list/mixed`.
    pub fn element_kind(&self) -> Option<ValueKind> {
        match self {
            TypeClass::Null | TypeClass::ListNull => Some(ValueKind::Null),
            TypeClass::Boolean | TypeClass::ListBoolean => Some(ValueKind::Boolean),
            TypeClass::Number | TypeClass::ListNumber => Some(ValueKind::Number),
            TypeClass::String | TypeClass::ListString => Some(ValueKind::String),
            TypeClass::ListMixed => None,
        }
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeClass {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        TypeClass::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QueryError::Config(format!("unknown type class '{}'", s)))
    }
}

/// Selects (part of) the clause value for a `%v` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    Whole,
    Index(usize),
    Range(Option<usize>, Option<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Sql(String),
    Column,
    Value(Slice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |message: String| QueryError::Template {
            template: source.to_string(),
            message,
        };
        let mut segments = Vec::new();
        let mut sql = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((at, c)) = chars.next() {
            if c != '%' {
                sql.push(c);
                continue;
            }
            let placeholder = match chars.next() {
                Some((_, '%')) => {
                    sql.push('%');
                    continue;
                }
                Some((_, 'c')) => Segment::Column,
                Some((_, 'v')) => {
                    if chars.peek().map(|(_, c)| *c) == Some('[') {
                        chars.next();
                        let mut inner = String::new();
                        loop {
                            match chars.next() {
                                Some((_, ']')) => break,
                                Some((_, c)) => inner.push(c),
                                None => return Err(invalid(format!("unclosed '[' at {}", at))),
                            }
                        }
                        Segment::Value(parse_slice(&inner).map_err(invalid)?)
                    } else {
                        Segment::Value(Slice::Whole)
                    }
                }
                Some((_, other)) => {
                    return Err(invalid(format!("unknown placeholder '%{}' at {}", other, at)))
                }
                None => return Err(invalid(format!("dangling '%' at {}", at))),
            };
            if !sql.is_empty() {
                segments.push(Segment::Sql(std::mem::take(&mut sql)));
            }
            segments.push(placeholder);
        }
        if !sql.is_empty() {
            segments.push(Segment::Sql(sql));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl FromStr for Template {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        Template::parse(s)
    }
}

fn parse_slice(inner: &str) -> std::result::Result<Slice, String> {
    let bound = |s: &str| -> std::result::Result<Option<usize>, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<usize>()
            .map(Some)
            .map_err(|_| format!("invalid index '{}'", s))
    };
    match inner.split_once(':') {
        Some((from, to)) => Ok(Slice::Range(bound(from)?, bound(to)?)),
        None => match bound(inner)? {
            Some(i) => Ok(Slice::Index(i)),
            None => Err("empty index".to_string()),
        },
    }
}

/// Shape check run against the clause token before rendering.
#[derive(Clone)]
pub enum Validator {
    /// Allowed numbers of values.
    Arity(Vec<usize>),
    Predicate(fn(&Token) -> bool),
}

impl Validator {
    pub fn check(&self, clause: &Token) -> bool {
        match self {
            Validator::Arity(allowed) => allowed.contains(&clause.clause_arity()),
            Validator::Predicate(f) => f(clause),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Arity(allowed) => f.debug_tuple("Arity").field(allowed).finish(),
            Validator::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub template: Template,
    pub validator: Option<Validator>,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<(TypeClass, String), Operator>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, class: TypeClass, name: &str, template: &str) -> Result<()> {
        self.insert(class, name, template, None)
    }

    pub fn add_with_validator(
        &mut self,
        class: TypeClass,
        name: &str,
        template: &str,
        validator: Validator,
    ) -> Result<()> {
        self.insert(class, name, template, Some(validator))
    }

    fn insert(
        &mut self,
        class: TypeClass,
        name: &str,
        template: &str,
        validator: Option<Validator>,
    ) -> Result<()> {
        let template = Template::parse(template)?;
        self.operators
            .insert((class, name.to_string()), Operator { template, validator });
        Ok(())
    }

    pub fn get(&self, class: TypeClass, name: &str) -> Option<&Operator> {
        self.operators.get(&(class, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// The built-in operator set.
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();

        registry.add(TypeClass::Null, "eq", "%c is %v")?;
        registry.add(TypeClass::Null, "neq", "%c is not %v")?;

        for class in [TypeClass::Boolean, TypeClass::Number, TypeClass::String] {
            registry.add(class, "eq", "%c = %v")?;
            registry.add(class, "neq", "%c <> %v")?;
        }
        for class in [TypeClass::Number, TypeClass::String] {
            registry.add(class, "lt", "%c < %v")?;
            registry.add(class, "gt", "%c > %v")?;
            registry.add(class, "lteq", "%c <= %v")?;
            registry.add(class, "gteq", "%c >= %v")?;
        }

        registry.add(TypeClass::String, "re", "%c ~ %v")?;
        registry.add(TypeClass::String, "ire", "%c ~* %v")?;
        registry.add(TypeClass::String, "nre", "%c !~ %v")?;
        registry.add(TypeClass::String, "nire", "%c !~* %v")?;

        for class in TypeClass::ALL.into_iter().filter(TypeClass::is_list) {
            registry.add(class, "in", "%c in (%v)")?;
            registry.add(class, "nin", "%c not in (%v)")?;
        }

        registry.add_with_validator(
            TypeClass::ListNumber,
            "bbi",
            "%c && ST_MakeEnvelope(%v)",
            Validator::Arity(vec![4, 5]),
        )?;
        registry.add_with_validator(
            TypeClass::ListNumber,
            "bbc",
            "%c @ ST_MakeEnvelope(%v)",
            Validator::Arity(vec![4, 5]),
        )?;
        registry.add_with_validator(
            TypeClass::ListNumber,
            "dlt",
            "ST_Distance(%c::geography, ST_Transform(ST_SetSRID(ST_Point(%v[1:3]), coalesce(%v[3], 4326)),4326)::geography, false) < %v[0]",
            Validator::Arity(vec![3, 4]),
        )?;

        Ok(registry)
    }
}
