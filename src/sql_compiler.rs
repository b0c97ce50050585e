//! SQL assembler that turns an [`Expansion`] into a parameterized statement.
//!
//! Fragments are emitted in order and can be gated on a flag, on a used
//! entity definition or on a used field, so joins that nothing refers to
//! never reach the statement. Values are bound as `:name` parameters and
//! can be rendered to a sea-query backend's positional placeholders.

use crate::error::{QueryError, Result};
use crate::expansion::Expansion;
use sea_query::{QueryBuilder, Value, Values};
use tracing::debug;

/// A bound parameter, either one value or a list expanded in place.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(Value),
    List(Vec<Value>),
}

impl ParamValue {
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        ParamValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self, ParamValue::List(values) if values.is_empty())
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        ParamValue::Scalar(value)
    }
}

/// Named parameters in binding order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`. Binding the same value twice is a no-op, a different
    /// value for a bound name is an error.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) -> Result<()> {
        let name = name.into();
        match self.get(&name) {
            Some(bound) if *bound == value => Ok(()),
            Some(_) => Err(QueryError::ParameterConflict { name }),
            None => {
                self.entries.push((name, value));
                Ok(())
            }
        }
    }

    /// Bind the next filter parameter and return its name.
    pub(crate) fn push_where(&mut self, value: ParamValue) -> String {
        let name = format!("pwhere_{}", self.entries.len());
        self.entries.push((name.clone(), value));
        name
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Shift every `:pwhere_N` in `sql` to `:pwhere_{N + offset}`.
fn rebase_where(sql: &str, offset: usize) -> String {
    const MARK: &str = ":pwhere_";
    if offset == 0 {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut rest = sql;
    while let Some(pos) = rest.find(MARK) {
        let (head, tail) = rest.split_at(pos + MARK.len());
        out.push_str(head);
        let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = tail[..digits].parse::<usize>() {
            out.push_str(&(n + offset).to_string());
        }
        rest = &tail[digits..];
    }
    out.push_str(rest);
    out
}

/// A finished statement with named placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Params,
}

impl Statement {
    /// Render `:name` placeholders in the style of `builder`, returning the
    /// SQL and the values in placeholder order. Lists expand to one
    /// placeholder per element and an empty list becomes `null`. Casts
    /// (`::type`) and quoted text are left alone.
    pub fn to_positional<B: QueryBuilder>(&self, builder: &B) -> Result<(String, Values)> {
        let (mark, numbered) = builder.placeholder();
        let mut values: Vec<Value> = Vec::new();
        let mut out = String::with_capacity(self.sql.len());
        let mut placeholder = |out: &mut String, value: Value| {
            values.push(value);
            out.push_str(mark);
            if numbered {
                out.push_str(&values.len().to_string());
            }
        };

        let mut chars = self.sql.chars().peekable();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            if quoted {
                out.push(c);
                quoted = c != '\'';
                continue;
            }
            match c {
                '\'' => {
                    quoted = true;
                    out.push(c);
                }
                ':' if chars.peek() == Some(&':') => {
                    chars.next();
                    out.push_str("::");
                }
                ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if !(n.is_ascii_alphanumeric() || n == '_') {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    let value = self.params.get(&name).ok_or_else(|| {
                        QueryError::Config(format!("parameter '{}' is not bound", name))
                    })?;
                    match value {
                        ParamValue::Scalar(v) => placeholder(&mut out, v.clone()),
                        ParamValue::List(list) if list.is_empty() => out.push_str("null"),
                        ParamValue::List(list) => {
                            for (i, v) in list.iter().enumerate() {
                                if i > 0 {
                                    out.push_str(", ");
                                }
                                placeholder(&mut out, v.clone());
                            }
                        }
                    }
                }
                _ => out.push(c),
            }
        }
        Ok((out, Values(values)))
    }
}

/// Accumulates SQL fragments and parameters over an expansion.
#[derive(Debug, Clone)]
pub struct StatementBuilder<'e> {
    expansion: &'e Expansion,
    fragments: Vec<String>,
    params: Params,
    // filter parameters bound by earlier expansions
    where_offset: usize,
    error: Option<QueryError>,
}

impl<'e> StatementBuilder<'e> {
    pub fn new(expansion: &'e Expansion) -> Self {
        Self {
            expansion,
            fragments: Vec::new(),
            params: Params::new(),
            where_offset: 0,
            error: None,
        }
    }

    pub fn expansion(&self) -> &'e Expansion {
        self.expansion
    }

    /// Continue on another expansion, keeping SQL and parameters.
    pub fn reset(&mut self, expansion: &'e Expansion) -> &mut Self {
        self.expansion = expansion;
        self
    }

    pub fn add_sql(&mut self, sql: &str) -> &mut Self {
        self.fragments.push(sql.to_string());
        self
    }

    pub fn add_sql_lines(&mut self, lines: &[&str]) -> &mut Self {
        self.fragments.extend(lines.iter().map(|l| l.to_string()));
        self
    }

    pub fn add_sql_if(&mut self, sql: &str, condition: bool) -> &mut Self {
        if condition {
            self.add_sql(sql);
        }
        self
    }

    /// Append `sql` if the field was selected or filtered.
    pub fn add_sql_if_alias(&mut self, sql: &str, alias: &str) -> &mut Self {
        let used = self.expansion.is_alias_used(alias);
        self.add_sql_if(sql, used)
    }

    /// Append `sql` if the entity definition was referenced.
    pub fn add_sql_if_definition(&mut self, sql: &str, def: &str) -> &mut Self {
        let used = self.expansion.is_def_used(def);
        self.add_sql_if(sql, used)
    }

    pub fn expand_select(&mut self) -> &mut Self {
        self.expand_select_prefix("", false)
    }

    /// Append the select list, preceded by `prefix` if `condition` holds.
    pub fn expand_select_prefix(&mut self, prefix: &str, condition: bool) -> &mut Self {
        let select = self.expansion.select_sql();
        if select.is_empty() {
            return self;
        }
        if condition {
            self.fragments.push(format!("{}{}", prefix, select));
        } else {
            self.fragments.push(select);
        }
        self
    }

    /// Append `and <filter>` and bind its parameters. Filter parameters
    /// are numbered after those of earlier expansions, so UNION branches
    /// never share a name.
    pub fn expand_where(&mut self) -> &mut Self {
        let expansion = self.expansion;
        if !expansion.has_where() {
            return self;
        }
        let offset = self.where_offset;
        self.fragments
            .push(format!("and {}", rebase_where(expansion.where_sql(), offset)));
        for (i, (_, value)) in expansion.where_params().iter().enumerate() {
            self.bind(format!("pwhere_{}", offset + i), value.clone());
        }
        self.where_offset += expansion.where_params().len();
        self
    }

    fn bind(&mut self, name: String, value: ParamValue) {
        if let Err(e) = self.params.insert(name, value) {
            if self.error.is_none() {
                self.error = Some(e);
            }
        }
    }

    pub fn set_parameter(&mut self, name: &str, value: impl Into<ParamValue>) -> &mut Self {
        self.bind(name.to_string(), value.into());
        self
    }

    /// Append `sql` and bind `name`, if a value is present.
    pub fn set_parameter_if_not_null<V: Into<ParamValue>>(
        &mut self,
        name: &str,
        value: Option<V>,
        sql: &str,
    ) -> &mut Self {
        if let Some(value) = value {
            self.add_sql(sql);
            self.set_parameter(name, value);
        }
        self
    }

    /// Append `sql` and bind `name`, if `values` is non-empty and
    /// `condition` holds.
    pub fn set_parameter_if_not_empty_and(
        &mut self,
        name: &str,
        values: ParamValue,
        sql: &str,
        condition: bool,
    ) -> &mut Self {
        if condition && !values.is_empty_list() {
            self.add_sql(sql);
            self.set_parameter(name, values);
        }
        self
    }

    pub fn group_by_if(&mut self, columns: &str, condition: bool) -> &mut Self {
        if condition {
            self.fragments.push(format!("group by {}", columns));
        }
        self
    }

    /// Group by `columns` and every selected output column.
    pub fn expand_group_by_if(&mut self, columns: &str, condition: bool) -> &mut Self {
        let selected = self.expansion.select_columns();
        if selected.is_empty() {
            return self.group_by_if(columns, condition);
        }
        let columns = format!("{}, {}", columns, selected.join(", "));
        self.group_by_if(&columns, condition)
    }

    pub fn order_by_if(&mut self, columns: &str, condition: bool) -> &mut Self {
        if condition {
            self.fragments.push(format!("order by {}", columns));
        }
        self
    }

    pub fn add_limit(&mut self, limit: Option<u64>) -> &mut Self {
        if let Some(limit) = limit {
            self.add_sql("limit :limit");
            self.set_parameter("limit", Value::BigInt(Some(to_bigint(limit))));
        }
        self
    }

    pub fn add_offset(&mut self, offset: Option<u64>) -> &mut Self {
        if let Some(offset) = offset {
            self.add_sql("offset :offset");
            self.set_parameter("offset", Value::BigInt(Some(to_bigint(offset))));
        }
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Finish the statement, failing if a parameter was bound twice with
    /// different values.
    pub fn build(&self) -> Result<Statement> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let statement = Statement {
            sql: self.fragments.join("\n"),
            params: self.params.clone(),
        };
        debug!(sql = %statement.sql, params = statement.params.len(), "statement built");
        Ok(statement)
    }
}

// INT8 binds are signed
fn to_bigint(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
