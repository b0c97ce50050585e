//! Select expansion: validates requested fields and filters against the
//! schema and emits SQL fragments with their parameter bindings.
//!
//! [`SelectExpansion`] is the shared, immutable engine. Each call to
//! [`SelectExpansion::expand`] returns a fresh [`Expansion`].

use crate::error::{QueryError, Result};
use crate::operator::{OperatorRegistry, Segment, Slice, Template, TypeClass};
use crate::parser::parse_filter;
use crate::schema::{Schema, TargetDef, TargetDefList};
use crate::sql_compiler::{ParamValue, Params};
use crate::token::{Token, TokenKind, TypedValue, ValueKind};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One filter clause applied to a field.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClauseTarget {
    pub alias: String,
    pub json_selector: Option<String>,
    pub operator: String,
    pub type_class: TypeClass,
    /// The `Value` or `List` token of the clause.
    pub values: Token,
}

impl WhereClauseTarget {
    /// The i-th value: a list element, or the scalar itself for `i == 0`.
    pub fn value(&self, i: usize) -> Option<&Token> {
        if self.values.is(TokenKind::List) {
            self.values.children.get(i)
        } else if i == 0 {
            Some(&self.values)
        } else {
            None
        }
    }
}

/// The result of one expansion call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expansion {
    scope: Vec<String>,
    used_target_names: Vec<String>,
    used_def_names: Vec<String>,
    select_columns: Vec<String>,
    expansion: HashMap<String, String>,
    where_sql: String,
    where_params: Params,
    where_targets: HashMap<String, Vec<WhereClauseTarget>>,
}

impl Expansion {
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Public names of the selected fields, in request order.
    pub fn used_target_names(&self) -> &[String] {
        &self.used_target_names
    }

    /// Entity definitions referenced by the select or the filter.
    pub fn used_def_names(&self) -> &[String] {
        &self.used_def_names
    }

    /// Output column names of the selected fields, in selection order.
    pub fn select_columns(&self) -> &[String] {
        &self.select_columns
    }

    /// Entity definition name → its column list.
    pub fn expansion(&self) -> &HashMap<String, String> {
        &self.expansion
    }

    pub fn expansion_for(&self, def: &str) -> Option<&str> {
        self.expansion.get(def).map(String::as_str)
    }

    /// All column lists, in first-reference order.
    pub fn select_sql(&self) -> String {
        self.used_def_names
            .iter()
            .filter_map(|d| self.expansion.get(d))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn has_where(&self) -> bool {
        !self.where_sql.is_empty()
    }

    pub fn where_sql(&self) -> &str {
        &self.where_sql
    }

    pub fn where_params(&self) -> &Params {
        &self.where_params
    }

    pub fn used_aliases_in_where(&self) -> &HashMap<String, Vec<WhereClauseTarget>> {
        &self.where_targets
    }

    pub fn is_def_used(&self, def: &str) -> bool {
        self.used_def_names.iter().any(|d| d == def)
    }

    /// True if the field was selected or filtered.
    pub fn is_alias_used(&self, alias: &str) -> bool {
        self.used_target_names.iter().any(|n| n == alias) || self.where_targets.contains_key(alias)
    }

    /// The type class a field is filtered with, folded over all its
    /// clauses. Null classes are compatible with everything and `list/x`
    /// matches `x`.
    pub fn where_type_class(&self, alias: &str) -> Result<Option<TypeClass>> {
        match self.where_targets.get(alias) {
            Some(targets) => fold_type_class(alias, targets),
            None => Ok(None),
        }
    }

    /// Every field must be filtered with compatible values. Clauses on
    /// different JSON paths of a field are checked separately.
    fn check_type_classes(&self) -> Result<()> {
        for (alias, targets) in &self.where_targets {
            let mut paths: Vec<(Option<&str>, Vec<&WhereClauseTarget>)> = Vec::new();
            for target in targets {
                let path = target.json_selector.as_deref();
                match paths.iter_mut().find(|(p, _)| *p == path) {
                    Some((_, group)) => group.push(target),
                    None => paths.push((path, vec![target])),
                }
            }
            for (_, group) in paths {
                fold_type_class(alias, group)?;
            }
        }
        Ok(())
    }

    fn use_name(&mut self, name: &str) {
        if !self.used_target_names.iter().any(|n| n == name) {
            self.used_target_names.push(name.to_string());
        }
    }

    fn use_def(&mut self, def: &str) {
        if !self.is_def_used(def) {
            self.used_def_names.push(def.to_string());
        }
    }
}

fn fold_type_class<'t>(
    alias: &str,
    targets: impl IntoIterator<Item = &'t WhereClauseTarget>,
) -> Result<Option<TypeClass>> {
    let mut folded: Option<TypeClass> = None;
    for target in targets {
        let class = target.type_class;
        folded = match folded {
            None => Some(class),
            Some(current) if current.is_null() => Some(class),
            Some(current) if class.is_null() || current == class => Some(current),
            Some(current) => match (current.element_kind(), class.element_kind()) {
                (Some(a), Some(b)) if a == b => Some(current),
                _ => {
                    return Err(QueryError::TypeConflict {
                        alias: alias.to_string(),
                        first: current.to_string(),
                        second: class.to_string(),
                    })
                }
            },
        };
    }
    Ok(folded)
}

/// Bookkeeping for a single select walk.
#[derive(Default)]
struct Visited {
    fields: HashSet<(String, String)>,
    nested: HashSet<String>,
    fragments: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SelectExpansion {
    schema: Schema,
    operators: OperatorRegistry,
}

impl SelectExpansion {
    pub fn new(schema: Schema, operators: OperatorRegistry) -> Result<Self> {
        schema.validate()?;
        Ok(Self { schema, operators })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    /// Expand `select` (comma separated public names, blank or `*` for
    /// everything) and compile `filter` within `scope`.
    pub fn expand(&self, select: &str, filter: Option<&str>, scope: &[&str]) -> Result<Expansion> {
        let lists = scope
            .iter()
            .map(|name| self.schema.get_or_err(name))
            .collect::<Result<Vec<_>>>()?;

        let mut result = Expansion {
            scope: scope.iter().map(|s| s.to_string()).collect(),
            ..Expansion::default()
        };

        let requested = self.requested(select, &lists, &result.scope)?;
        let mut explicit: HashMap<&str, Vec<&TargetDef>> = HashMap::new();
        for &(list, def) in &requested {
            explicit.entry(list.name()).or_default().push(def);
        }

        let mut visited = Visited::default();
        for &(list, def) in &requested {
            self.add_target(list, def, &explicit, scope, &mut visited, &mut result);
        }
        result.expansion = visited
            .fragments
            .into_iter()
            .map(|(def, parts)| (def, parts.join(", ")))
            .collect();

        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            let root = parse_filter(filter)?;
            let mut params = Params::new();
            let where_sql = self.render_node(&root, &lists, &mut params, &mut result)?;
            result.where_sql = where_sql;
            result.where_params = params;
            result.check_type_classes()?;
        }

        debug!(
            select,
            scope = ?scope,
            names = ?result.used_target_names,
            where_sql = %result.where_sql,
            "select expansion"
        );
        Ok(result)
    }

    fn requested<'s>(
        &'s self,
        select: &str,
        lists: &[&'s TargetDefList],
        scope: &[String],
    ) -> Result<Vec<(&'s TargetDefList, &'s TargetDef)>> {
        let select = select.trim();
        if select.is_empty() || select == "*" {
            return Ok(lists
                .iter()
                .flat_map(|list| list.iter().map(move |def| (*list, def)))
                .collect());
        }
        select
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| resolve(name, lists, scope))
            .collect()
    }

    fn add_target<'s>(
        &'s self,
        list: &'s TargetDefList,
        def: &'s TargetDef,
        explicit: &HashMap<&str, Vec<&'s TargetDef>>,
        scope: &[&str],
        visited: &mut Visited,
        result: &mut Expansion,
    ) {
        let key = (list.name().to_string(), def.public_name().to_string());
        if !visited.fields.insert(key) {
            return;
        }
        result.use_name(def.public_name());
        result.use_def(list.name());

        if let Some(sql) = def.select_sql() {
            result
                .select_columns
                .extend(def.output_names().into_iter().map(str::to_string));
            visited
                .fragments
                .entry(list.name().to_string())
                .or_default()
                .push(sql);
        }

        // nested entities expand only inside the scope, once per call
        let Some((target, _)) = def.nested_target() else {
            return;
        };
        if !scope.contains(&target) || !visited.nested.insert(target.to_string()) {
            return;
        }
        let Some(nested) = self.schema.get(target) else {
            return;
        };
        let fields: Vec<&TargetDef> = match explicit.get(target) {
            Some(fields) => fields.clone(),
            None => nested.iter().collect(),
        };
        for field in fields {
            self.add_target(nested, field, explicit, scope, visited, result);
        }
    }

    fn render_node(
        &self,
        token: &Token,
        lists: &[&TargetDefList],
        params: &mut Params,
        result: &mut Expansion,
    ) -> Result<String> {
        let connective = match token.kind {
            TokenKind::And => " AND ",
            TokenKind::Or => " OR ",
            _ => return self.render_clause(token, lists, params, result),
        };
        let mut parts = Vec::with_capacity(token.child_count());
        for child in &token.children {
            parts.push(self.render_node(child, lists, params, result)?);
        }
        Ok(format!("({})", parts.join(connective)))
    }

    fn render_clause(
        &self,
        clause: &Token,
        lists: &[&TargetDefList],
        params: &mut Params,
        result: &mut Expansion,
    ) -> Result<String> {
        let alias = clause.child(TokenKind::Alias).map(Token::value_str).unwrap_or("");
        let operator = clause.child(TokenKind::Operator).map(Token::value_str).unwrap_or("");
        let selector = clause.child(TokenKind::JsonSelector).map(Token::value_str);
        let values = clause
            .clause_values()
            .ok_or_else(|| QueryError::Config(format!("clause on '{}' has no value", alias)))?;

        let (list, def) = resolve(alias, lists, &result.scope)?;
        let type_class = TypeClass::infer(values);
        let not_allowed = || QueryError::UnknownOperator {
            alias: alias.to_string(),
            operator: operator.to_string(),
            type_class: type_class.to_string(),
        };
        let registered = self.operators.get(type_class, operator).ok_or_else(not_allowed)?;
        if let Some(validator) = &registered.validator {
            if !validator.check(clause) {
                return Err(QueryError::OperatorShape {
                    alias: alias.to_string(),
                    operator: operator.to_string(),
                    type_class: type_class.to_string(),
                });
            }
        }
        let column_sql = def.column_sql().ok_or_else(not_allowed)?;

        let column = ColumnRef {
            sql: column_sql,
            selector,
            cast: type_class.element_kind(),
        };
        let sql = render_template(&registered.template, &column, values, params);

        result.use_def(list.name());
        result
            .where_targets
            .entry(alias.to_string())
            .or_default()
            .push(WhereClauseTarget {
                alias: alias.to_string(),
                json_selector: selector.map(str::to_string),
                operator: operator.to_string(),
                type_class,
                values: values.clone(),
            });
        Ok(sql)
    }
}

/// Find a field by public name in the first scope entity that has it.
fn resolve<'s>(
    name: &str,
    lists: &[&'s TargetDefList],
    scope: &[String],
) -> Result<(&'s TargetDefList, &'s TargetDef)> {
    lists
        .iter()
        .find_map(|list| list.find(name).map(|def| (*list, def)))
        .ok_or_else(|| QueryError::UnknownField {
            target_name: name.to_string(),
            scope: scope.to_vec(),
        })
}

struct ColumnRef<'a> {
    sql: &'a str,
    selector: Option<&'a str>,
    cast: Option<ValueKind>,
}

impl ColumnRef<'_> {
    fn render(&self, params: &mut Params) -> String {
        let Some(selector) = self.selector else {
            return self.sql.to_string();
        };
        let path = selector
            .split('.')
            .map(|segment| TypedValue::String(segment.to_string()).to_sql_value())
            .collect();
        let name = params.push_where(ParamValue::List(path));
        let extract = format!("jsonb_extract_path_text({}, :{})", self.sql, name);
        match self.cast {
            Some(ValueKind::Number) => format!("({})::double precision", extract),
            Some(ValueKind::Boolean) => format!("({})::boolean", extract),
            _ => extract,
        }
    }
}

fn render_template(template: &Template, column: &ColumnRef, values: &Token, params: &mut Params) -> String {
    let mut sql = String::new();
    let mut column_sql: Option<String> = None;
    for segment in template.segments() {
        match segment {
            Segment::Sql(text) => sql.push_str(text),
            Segment::Column => {
                let rendered = column_sql.get_or_insert_with(|| column.render(params));
                sql.push_str(rendered);
            }
            Segment::Value(slice) => sql.push_str(&render_value(*slice, values, params)),
        }
    }
    sql
}

fn render_value(slice: Slice, values: &Token, params: &mut Params) -> String {
    let elements: Vec<&Token> = if values.is(TokenKind::List) {
        values.children.iter().collect()
    } else {
        vec![values]
    };
    let to_value = |t: &Token| {
        t.typed_value()
            .map(TypedValue::to_sql_value)
            .unwrap_or(sea_query::Value::String(None))
    };

    match slice {
        Slice::Whole if values.is(TokenKind::List) => {
            let list = elements.into_iter().map(to_value).collect();
            format!(":{}", params.push_where(ParamValue::List(list)))
        }
        Slice::Whole | Slice::Index(_) => {
            let index = match slice {
                Slice::Index(i) => i,
                _ => 0,
            };
            match elements.get(index) {
                Some(t) if t.value_kind() != Some(ValueKind::Null) => {
                    format!(":{}", params.push_where(ParamValue::Scalar(to_value(*t))))
                }
                _ => "null".to_string(),
            }
        }
        Slice::Range(from, to) => {
            let len = elements.len();
            let start = from.unwrap_or(0).min(len);
            let end = to.unwrap_or(len).min(len).max(start);
            let list = elements[start..end].iter().copied().map(to_value).collect();
            format!(":{}", params.push_where(ParamValue::List(list)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Validator;
    use crate::schema::LookUpType;
    use sea_query::Value;

    fn nested() -> SelectExpansion {
        let mut schema = Schema::new();
        schema
            .add(
                TargetDefList::new("A")
                    .add(TargetDef::column("a", "A.a"))
                    .add(TargetDef::column("b", "A.b"))
                    .add(TargetDef::nested("c", "C", LookUpType::Inline)),
            )
            .unwrap();
        schema
            .add(
                TargetDefList::new("B")
                    .add(TargetDef::column("x", "B.x"))
                    .add(TargetDef::nested("y", "A", LookUpType::Inline)),
            )
            .unwrap();
        schema
            .add(TargetDefList::new("C").add(TargetDef::column("h", "C.h")))
            .unwrap();
        SelectExpansion::new(schema, OperatorRegistry::new()).unwrap()
    }

    fn flat() -> SelectExpansion {
        let mut schema = Schema::new();
        schema
            .add(
                TargetDefList::new("A")
                    .add(TargetDef::column("a", "A.a"))
                    .add(TargetDef::column("b", "A.b")),
            )
            .unwrap();
        schema
            .add(TargetDefList::new("B").add(TargetDef::column("x", "B.x")))
            .unwrap();
        schema
            .add(TargetDefList::new("C").add(TargetDef::column("i", "C.i")))
            .unwrap();
        let mut operators = OperatorRegistry::new();
        operators.add(TypeClass::Null, "eq", "%c is %v").unwrap();
        operators.add(TypeClass::Number, "eq", "%c = %v").unwrap();
        SelectExpansion::new(schema, operators).unwrap()
    }

    fn nested_big() -> SelectExpansion {
        let mut schema = Schema::new();
        schema
            .add(
                TargetDefList::new("A")
                    .add(TargetDef::column("a", "A.a"))
                    .add(TargetDef::column("b", "A.b")),
            )
            .unwrap();
        schema
            .add(
                TargetDefList::new("B")
                    .add(TargetDef::column("x", "B.x").alias("x_replaced"))
                    .add(TargetDef::nested("y", "A", LookUpType::Inline)),
            )
            .unwrap();
        schema
            .add(
                TargetDefList::new("C")
                    .add(TargetDef::column("i", "C.i"))
                    .add(TargetDef::nested("j", "B", LookUpType::Inline)),
            )
            .unwrap();
        schema
            .add(TargetDefList::new("E").add(TargetDef::nested("j", "B", LookUpType::Inline)))
            .unwrap();
        let mut operators = OperatorRegistry::new();
        operators.add(TypeClass::Null, "eq", "%c is %v").unwrap();
        SelectExpansion::new(schema, operators).unwrap()
    }

    fn minimal() -> SelectExpansion {
        let mut schema = Schema::new();
        schema
            .add(TargetDefList::new("A").add(TargetDef::column("a", "A.a")))
            .unwrap();
        let mut operators = OperatorRegistry::standard().unwrap();
        operators
            .add(TypeClass::ListNumber, "slicea", "%v[0] %v[1:] %v[1:3] %v[:3] %v[4] %v[4:6]")
            .unwrap();
        SelectExpansion::new(schema, operators).unwrap()
    }

    fn int(n: i64) -> ParamValue {
        ParamValue::Scalar(Value::BigInt(Some(n)))
    }

    fn int_list(ns: &[i64]) -> ParamValue {
        ParamValue::List(ns.iter().map(|n| Value::BigInt(Some(*n))).collect())
    }

    #[test]
    fn test_flat_structure() {
        let se = flat();
        let exp = se.expand("a", None, &["A", "C"]).unwrap();
        assert_eq!(exp.used_target_names(), ["a"]);

        let err = se.expand("a, i, x", None, &["A", "C"]).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
        match err {
            QueryError::UnknownField { target_name, scope } => {
                assert_eq!(target_name, "x");
                assert_eq!(scope, vec!["A", "C"]);
            }
            other => panic!("Expected UnknownField, got {:?}", other),
        }
    }

    #[test]
    fn test_star_and_blank_select() {
        let se = flat();
        let exp = se.expand("*", None, &["B", "A"]).unwrap();
        assert_eq!(exp.used_target_names(), ["x", "a", "b"]);
        assert_eq!(exp.used_def_names(), ["B", "A"]);
        assert_eq!(exp.select_sql(), "B.x as x, A.a as a, A.b as b");

        let blank = se.expand("  ", None, &["B", "A"]).unwrap();
        assert_eq!(blank, exp);
    }

    #[test]
    fn test_unknown_scope_definition() {
        let err = flat().expand("a", None, &["A", "Z"]).unwrap_err();
        assert_eq!(err.code(), "DEFLIST_NOT_FOUND");
    }

    #[test]
    fn test_nested_requires_scope() {
        let se = nested_big();
        let exp = se.expand("a", None, &["A", "C"]).unwrap();
        assert_eq!(exp.used_target_names(), ["a"]);

        let exp = nested().expand("y", None, &["B"]).unwrap();
        assert_eq!(exp.used_target_names(), ["y"]);
        assert_eq!(exp.used_def_names(), ["B"]);
        assert!(exp.expansion().is_empty());
    }

    #[test]
    fn test_alias() {
        let se = nested_big();
        let exp = se.expand("x_replaced", None, &["B"]).unwrap();
        assert_eq!(exp.used_target_names(), ["x_replaced"]);

        let err = se.expand("x", None, &["B"]).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
    }

    #[test]
    fn test_alias_with_where_clause() {
        let se = nested_big();
        let exp = se
            .expand("x_replaced", Some("x_replaced.eq.null"), &["B"])
            .unwrap();
        assert_eq!(exp.used_target_names(), ["x_replaced"]);
        assert_eq!(exp.expansion_for("B"), Some("B.x as x_replaced"));
        assert_eq!(exp.where_sql(), "(B.x is null)");
        assert!(exp.where_params().is_empty());

        let err = se.expand("x_replaced", Some("x.eq.null"), &["B"]).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
    }

    #[test]
    fn test_expansion() {
        let se = nested();
        let exp = se.expand("a", None, &["A"]).unwrap();
        assert_eq!(exp.used_target_names(), ["a"]);
        assert_eq!(exp.used_def_names(), ["A"]);
        assert_eq!(exp.expansion_for("A"), Some("A.a as a"));
        assert_eq!(exp.expansion().len(), 1);

        assert!(se.expand("a", None, &["B"]).is_err());

        let exp = se.expand("a, b", None, &["A", "B"]).unwrap();
        assert_eq!(exp.used_target_names(), ["a", "b"]);
        assert_eq!(exp.used_def_names(), ["A"]);
        assert_eq!(exp.expansion_for("A"), Some("A.a as a, A.b as b"));
        assert_eq!(exp.expansion().len(), 1);

        let exp = se.expand("x, y", None, &["A", "B", "C"]).unwrap();
        assert_eq!(exp.used_target_names(), ["x", "y", "a", "b", "c", "h"]);
        assert_eq!(exp.used_def_names(), ["B", "A", "C"]);
        assert_eq!(exp.expansion_for("A"), Some("A.a as a, A.b as b"));
        assert_eq!(exp.expansion_for("B"), Some("B.x as x"));
        assert_eq!(exp.expansion_for("C"), Some("C.h as h"));
        assert_eq!(exp.expansion().len(), 3);
        assert_eq!(exp.select_sql(), "B.x as x, A.a as a, A.b as b, C.h as h");
    }

    #[test]
    fn test_explicit_names_narrow_nested() {
        let exp = nested().expand("y, b", None, &["A", "B"]).unwrap();
        assert_eq!(exp.used_target_names(), ["y", "b"]);
        assert_eq!(exp.used_def_names(), ["B", "A"]);
        assert_eq!(exp.expansion_for("A"), Some("A.b as b"));
        assert_eq!(exp.expansion_for("B"), None);
    }

    #[test]
    fn test_cyclic_schema_terminates() {
        let mut schema = Schema::new();
        schema
            .add(
                TargetDefList::new("station")
                    .add(TargetDef::column("sname", "s.name"))
                    .add(TargetDef::nested("sparent", "station", LookUpType::Inline)),
            )
            .unwrap();
        let se = SelectExpansion::new(schema, OperatorRegistry::new()).unwrap();
        let exp = se.expand("sparent", None, &["station"]).unwrap();
        assert_eq!(exp.used_target_names(), ["sparent", "sname"]);
        assert_eq!(exp.expansion_for("station"), Some("s.name as sname"));
    }

    #[test]
    fn test_idempotent_on_fresh_calls() {
        let se = nested();
        let first = se.expand("x, y", Some(""), &["A", "B", "C"]).unwrap();
        let second = se.expand("x, y", None, &["A", "B", "C"]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_where_bounding_box() {
        let se = minimal();
        let err = se.expand("a", Some("a.bbi.(1,2,3,4,5,6)"), &["A"]).unwrap_err();
        assert_eq!(err.code(), "OP_SHAPE_INVALID");

        let exp = se.expand("a", Some("a.bbi.(1,2,3,4)"), &["A"]).unwrap();
        assert_eq!(exp.where_sql(), "(A.a && ST_MakeEnvelope(:pwhere_0))");
        assert_eq!(exp.where_params().len(), 1);
        assert_eq!(exp.where_params().get("pwhere_0"), Some(&int_list(&[1, 2, 3, 4])));

        assert!(se.expand("a", Some("a.bbi.(1,2,3,4,5)"), &["A"]).is_ok());
    }

    #[test]
    fn test_where_distance_slices() {
        let se = minimal();
        let err = se.expand("a", Some("a.dlt.(20,1,2,4,5)"), &["A"]).unwrap_err();
        assert_eq!(err.code(), "OP_SHAPE_INVALID");

        let exp = se.expand("a", Some("a.dlt.(20,1,2)"), &["A"]).unwrap();
        assert_eq!(
            exp.where_sql(),
            "(ST_Distance(A.a::geography, ST_Transform(ST_SetSRID(ST_Point(:pwhere_0), coalesce(null, 4326)),4326)::geography, false) < :pwhere_1)"
        );

        let exp = se.expand("a", Some("a.dlt.(20,1,2,4326)"), &["A"]).unwrap();
        assert_eq!(
            exp.where_sql(),
            "(ST_Distance(A.a::geography, ST_Transform(ST_SetSRID(ST_Point(:pwhere_0), coalesce(:pwhere_1, 4326)),4326)::geography, false) < :pwhere_2)"
        );
        assert_eq!(exp.where_params().get("pwhere_0"), Some(&int_list(&[1, 2])));
        assert_eq!(exp.where_params().get("pwhere_1"), Some(&int(4326)));
        assert_eq!(exp.where_params().get("pwhere_2"), Some(&int(20)));
    }

    #[test]
    fn test_where_slice_placeholders() {
        let exp = minimal().expand("a", Some("a.slicea.(0,1,2,3)"), &["A"]).unwrap();
        assert_eq!(
            exp.where_sql(),
            "(:pwhere_0 :pwhere_1 :pwhere_2 :pwhere_3 null :pwhere_4)"
        );
        let params = exp.where_params();
        assert_eq!(params.get("pwhere_0"), Some(&int(0)));
        assert_eq!(params.get("pwhere_1"), Some(&int_list(&[1, 2, 3])));
        assert_eq!(params.get("pwhere_2"), Some(&int_list(&[1, 2])));
        assert_eq!(params.get("pwhere_3"), Some(&int_list(&[0, 1, 2])));
        assert_eq!(params.get("pwhere_4"), Some(&int_list(&[])));
    }

    #[test]
    fn test_where_in_lists() {
        let se = minimal();
        let exp = se.expand("a", Some("a.in.()"), &["A"]).unwrap();
        assert_eq!(exp.where_sql(), "(A.a in (:pwhere_0))");
        assert_eq!(exp.where_params().get("pwhere_0"), Some(&ParamValue::List(vec![])));

        let exp = se.expand("a", Some("a.in.(null,null)"), &["A"]).unwrap();
        assert_eq!(exp.where_sql(), "(A.a in (:pwhere_0))");
        assert_eq!(
            exp.where_params().get("pwhere_0"),
            Some(&ParamValue::List(vec![Value::String(None), Value::String(None)]))
        );
    }

    #[test]
    fn test_where_syntax_errors() {
        let se = minimal();
        for filter in ["a.eq.1.and(a.eq.0)", "a.bbi.(1,2,3,4,5,6).and(a.eq.0)"] {
            let err = se.expand("a", Some(filter), &["A"]).unwrap_err();
            assert_eq!(err.code(), "SYNTAX_ERROR", "{}", filter);
        }
    }

    #[test]
    fn test_where_logical_groups() {
        let exp = flat()
            .expand("a", Some("and(or(a.eq.null,b.eq.5))"), &["A"])
            .unwrap();
        assert_eq!(exp.where_sql(), "(((A.a is null OR A.b = :pwhere_0)))");
        assert_eq!(exp.where_params().len(), 1);
        assert_eq!(exp.where_params().get("pwhere_0"), Some(&int(5)));
    }

    #[test]
    fn test_used_aliases_in_where() {
        let se = minimal();
        let exp = se.expand("a", Some("a.eq.3"), &["A"]).unwrap();
        let targets = &exp.used_aliases_in_where()["a"];
        assert_eq!(targets[0].type_class, TypeClass::Number);
        assert_eq!(targets[0].value(0).unwrap().typed_value(), Some(&TypedValue::Int(3)));
        assert_eq!(exp.where_params().get("pwhere_0"), Some(&int(3)));
        assert_eq!(exp.where_sql(), "(A.a = :pwhere_0)");

        let exp = se.expand("a", Some("a.in.(1,3.2,a,null)"), &["A"]).unwrap();
        let target = &exp.used_aliases_in_where()["a"][0];
        assert_eq!(target.value(0).unwrap().typed_value(), Some(&TypedValue::Int(1)));
        assert_eq!(target.value(1).unwrap().typed_value(), Some(&TypedValue::Float(3.2)));
        assert_eq!(
            target.value(2).unwrap().typed_value(),
            Some(&TypedValue::String("a".to_string()))
        );
        assert_eq!(target.value(3).unwrap().typed_value(), Some(&TypedValue::Null));
        assert!(target.value(4).is_none());
    }

    #[test]
    fn test_where_lookup_errors() {
        let se = minimal();
        let err = se.expand("a", Some("a.lt.true"), &["A"]).unwrap_err();
        assert_eq!(err.code(), "OP_NOT_ALLOWED");

        let err = se.expand("a", Some("z.eq.1"), &["A"]).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
    }

    #[test]
    fn test_where_type_class() {
        let se = minimal();
        let exp = se
            .expand("a", Some("a.eq.1,a.in.(2,3),a.eq.null"), &["A"])
            .unwrap();
        assert_eq!(exp.where_type_class("a").unwrap(), Some(TypeClass::Number));
        assert_eq!(exp.where_type_class("b").unwrap(), None);

        let exp = se.expand("a", Some("a.eq.null,a.eq.x"), &["A"]).unwrap();
        assert_eq!(exp.where_type_class("a").unwrap(), Some(TypeClass::String));

        assert!(se.expand("a", Some("a.in.(1,2),a.eq.null"), &["A"]).is_ok());
    }

    #[test]
    fn test_conflicting_filter_types_fail_expansion() {
        let se = minimal();
        match se.expand("a", Some("a.eq.1,a.eq.x"), &["A"]) {
            Err(QueryError::TypeConflict { alias, first, second }) => {
                assert_eq!(alias, "a");
                assert_eq!(first, "number");
                assert_eq!(second, "string");
            }
            other => panic!("Expected TypeConflict, got {:?}", other),
        }

        let err = se.expand("a", Some("or(a.eq.true,a.in.(1,2))"), &["A"]).unwrap_err();
        assert_eq!(err.code(), "WHERE_WRONG_DATA_TYPE");
    }

    #[test]
    fn test_json_selector_column() {
        let mut schema = Schema::new();
        schema
            .add(TargetDefList::new("station").add(TargetDef::column("smetadata", "m.json")))
            .unwrap();
        let se = SelectExpansion::new(schema, OperatorRegistry::standard().unwrap()).unwrap();

        let exp = se
            .expand("smetadata", Some("smetadata.aa.bbb.eq.5"), &["station"])
            .unwrap();
        assert_eq!(
            exp.where_sql(),
            "((jsonb_extract_path_text(m.json, :pwhere_0))::double precision = :pwhere_1)"
        );
        assert_eq!(
            exp.where_params().get("pwhere_0"),
            Some(&ParamValue::List(vec![
                Value::String(Some(Box::new("aa".to_string()))),
                Value::String(Some(Box::new("bbb".to_string()))),
            ]))
        );
        assert_eq!(exp.where_params().get("pwhere_1"), Some(&int(5)));
        let target = &exp.used_aliases_in_where()["smetadata"][0];
        assert_eq!(target.json_selector.as_deref(), Some("aa.bbb"));

        let filters = [
            "smetadata.aa.bbb.eq.",
            r#"smetadata.aa.bbb.eq."""#,
            "smetadata.aa.bbb.eq.null",
            "smetadata.aa.bbb.eq.-1",
            "smetadata.aa.bbb.eq.hallo",
            r#"smetadata.aa.bbb.eq.".......""#,
            "smetadata.aa.bbb.in.()",
            "smetadata.aa.bbb.in.(null)",
            "smetadata.aa.bbb.in.(null,null)",
            "smetadata.aa.bbb.in.(null,x,null)",
            "smetadata.aa.bbb.in.(1,2,3)",
            "smetadata.aa.bbb.in.(1,hallo)",
        ];
        for filter in filters {
            assert!(
                se.expand("smetadata", Some(filter), &["station"]).is_ok(),
                "{}",
                filter
            );
        }
    }

    #[test]
    fn test_values_never_reach_sql_text() {
        let se = minimal();
        let filter = r#"or(a.eq."x'; drop table a; --",a.in.("\"evil\"",2))"#;
        let exp = se.expand("a", Some(filter), &["A"]).unwrap();
        assert_eq!(exp.where_sql(), "((A.a = :pwhere_0 OR A.a in (:pwhere_1)))");
        assert!(!exp.where_sql().contains("drop"));
        assert!(!exp.where_sql().contains('\''));
        assert_eq!(exp.where_params().len(), 2);
    }

    #[test]
    fn test_predicate_validator() {
        let mut schema = Schema::new();
        schema
            .add(TargetDefList::new("A").add(TargetDef::column("a", "A.a")))
            .unwrap();
        let mut operators = OperatorRegistry::new();
        operators
            .add_with_validator(
                TypeClass::String,
                "like",
                "%c like %v",
                Validator::Predicate(|t| t.child(TokenKind::JsonSelector).is_none()),
            )
            .unwrap();
        let se = SelectExpansion::new(schema, operators).unwrap();
        assert!(se.expand("a", Some("a.like.x%"), &["A"]).is_ok());
        assert_eq!(
            se.expand("a", Some("a.k.like.x%"), &["A"]).unwrap_err().code(),
            "OP_SHAPE_INVALID"
        );
    }
}
