//! Folds ordered flat rows into a nested JSON tree.
//!
//! Level 0 is a map keyed by the first hierarchy column and holds objects
//! of the entry entity. Each further level lives under the first `Map`
//! field of the previous level's entity. Below the last level, the first
//! `List` field of the deepest entity receives one object per row.
//! Folding stops early at an exit point.

use crate::error::{QueryError, Result};
use crate::schema::{LookUpType, Schema, TargetDefList};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

pub type Row = Map<String, Value>;

/// An entity at which folding stops. With `include` the entity is the
/// deepest object of the tree, otherwise its owner is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPoint {
    pub entity: String,
    pub include: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBuilderConfig {
    pub entry_point: String,
    /// Grouping columns, most significant first. Rows must be sorted by them.
    pub hierarchy: Vec<String>,
    pub show_null: bool,
    pub exit_points: Vec<ExitPoint>,
    /// Upper bound of the response in MB, `0` for no bound.
    pub max_size_mb: usize,
}

impl ResultBuilderConfig {
    pub fn new(entry_point: impl Into<String>, hierarchy: &[&str], show_null: bool) -> Self {
        Self {
            entry_point: entry_point.into(),
            hierarchy: hierarchy.iter().map(|h| h.to_string()).collect(),
            show_null,
            exit_points: Vec::new(),
            max_size_mb: 0,
        }
    }

    /// Replace all exit points with `entity`, kept in the result.
    pub fn set_exit_point(self, entity: impl Into<String>) -> Self {
        self.clear_exit_points().add_exit_point(entity, true)
    }

    pub fn add_exit_point(mut self, entity: impl Into<String>, include: bool) -> Self {
        let entity = entity.into();
        self.exit_points.retain(|e| e.entity != entity);
        self.exit_points.push(ExitPoint { entity, include });
        self
    }

    pub fn clear_exit_points(mut self) -> Self {
        self.exit_points.clear();
        self
    }

    pub fn max_size_mb(mut self, max_size_mb: usize) -> Self {
        self.max_size_mb = max_size_mb;
        self
    }

    pub fn exit_point(&self, entity: &str) -> Option<&ExitPoint> {
        self.exit_points.iter().find(|e| e.entity == entity)
    }
}

#[derive(Debug, Clone, Copy)]
struct Place {
    /// Level index, or `levels.len()` for the leaf object.
    level: usize,
    merge: bool,
}

struct Level<'s> {
    key_column: &'s str,
    /// Field of this level's object holding the next level.
    child_field: Option<&'s str>,
}

struct Plan<'s> {
    levels: Vec<Level<'s>>,
    leaf_field: Option<&'s str>,
    places: HashMap<&'s str, Place>,
    /// Columns of entities cut off by an exit point.
    dropped: HashSet<&'s str>,
}

impl<'s> Plan<'s> {
    fn new(schema: &'s Schema, config: &'s ResultBuilderConfig) -> Result<Self> {
        let entry = schema.get(&config.entry_point).ok_or_else(|| {
            QueryError::Config(format!("unknown entry point '{}'", config.entry_point))
        })?;
        let depth = config.hierarchy.len();

        // entities from the entry point down, each with the field that holds it
        let mut chain: Vec<(&'s TargetDefList, Option<&'s str>)> = vec![(entry, None)];
        let mut exit = None;
        while let Some(&(def, _)) = chain.last() {
            if let Some(point) = config.exit_point(def.name()) {
                exit = Some((def, point.include));
                break;
            }
            let len = chain.len();
            if len > depth || depth == 0 {
                break;
            }
            if len < depth {
                let field = def.first_nested(LookUpType::Map).ok_or_else(|| {
                    QueryError::Config(format!(
                        "hierarchy level '{}' has no map field in '{}'",
                        config.hierarchy[len],
                        def.name()
                    ))
                })?;
                let next = nested_list(schema, field.nested_target())?;
                chain.push((next, Some(field.public_name())));
            } else {
                match def.first_nested(LookUpType::List) {
                    Some(field) => {
                        let leaf = nested_list(schema, field.nested_target())?;
                        chain.push((leaf, Some(field.public_name())));
                    }
                    None => break,
                }
            }
        }

        let mut cut = Vec::new();
        if let Some((def, include)) = exit {
            if include {
                for field in def.iter() {
                    if let Some((target, LookUpType::Map | LookUpType::List)) = field.nested_target() {
                        cut.extend(schema.get(target));
                    }
                }
            } else {
                if chain.len() == 1 {
                    return Err(QueryError::Config(format!(
                        "entry point '{}' cannot be excluded",
                        def.name()
                    )));
                }
                chain.pop();
                cut.push(def);
            }
        }

        let levels_len = chain.len().min(depth);
        let levels: Vec<Level<'s>> = (0..levels_len)
            .map(|i| Level {
                key_column: config.hierarchy[i].as_str(),
                child_field: if i + 1 < levels_len { chain[i + 1].1 } else { None },
            })
            .collect();
        let leaf_field = if depth > 0 && chain.len() > depth {
            chain[depth].1
        } else {
            None
        };

        let mut places = HashMap::new();
        for (level, (def, _)) in chain.into_iter().enumerate() {
            collect_places(schema, def, level, false, &mut HashSet::new(), &mut places);
        }
        let mut dropped = HashSet::new();
        let mut seen = HashSet::new();
        for def in cut {
            collect_columns(schema, def, &mut seen, &mut dropped);
        }
        dropped.retain(|column| !places.contains_key(column));

        Ok(Self {
            levels,
            leaf_field,
            places,
            dropped,
        })
    }

    fn innermost(&self) -> usize {
        if self.leaf_field.is_some() {
            self.levels.len()
        } else {
            self.levels.len().saturating_sub(1)
        }
    }
}

fn nested_list<'s>(
    schema: &'s Schema,
    target: Option<(&str, LookUpType)>,
) -> Result<&'s TargetDefList> {
    let (name, _) = target.ok_or_else(|| QueryError::Config("expected a nested field".to_string()))?;
    schema
        .get(name)
        .ok_or_else(|| QueryError::Config(format!("unknown entity definition '{}'", name)))
}

/// Columns owned by an entity, including those of inline and merge fields.
fn collect_places<'s>(
    schema: &'s Schema,
    def: &'s TargetDefList,
    level: usize,
    merge: bool,
    seen: &mut HashSet<&'s str>,
    places: &mut HashMap<&'s str, Place>,
) {
    if !seen.insert(def.name()) {
        return;
    }
    for field in def.iter() {
        match field.nested_target() {
            None => {
                places
                    .entry(field.public_name())
                    .or_insert(Place { level, merge });
            }
            Some((target, lookup @ (LookUpType::Inline | LookUpType::Merge))) => {
                if let Some(nested) = schema.get(target) {
                    let merge = merge || lookup == LookUpType::Merge;
                    collect_places(schema, nested, level, merge, seen, places);
                }
            }
            Some(_) => {}
        }
    }
}

/// Every column reachable from an entity, through any nested field.
fn collect_columns<'s>(
    schema: &'s Schema,
    def: &'s TargetDefList,
    seen: &mut HashSet<&'s str>,
    columns: &mut HashSet<&'s str>,
) {
    if !seen.insert(def.name()) {
        return;
    }
    for field in def.iter() {
        match field.nested_target() {
            None => {
                columns.insert(field.public_name());
            }
            Some((target, _)) => {
                if let Some(nested) = schema.get(target) {
                    collect_columns(schema, nested, seen, columns);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KeyKind {
    Null,
    Bool,
    Number,
    String,
    Json,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::Null => "null",
            KeyKind::Bool => "boolean",
            KeyKind::Number => "number",
            KeyKind::String => "string",
            KeyKind::Json => "json",
        };
        f.write_str(name)
    }
}

/// A hierarchy column value. Values of different kinds never share a
/// container, even when their text is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HierarchyKey {
    kind: KeyKind,
    text: String,
}

impl HierarchyKey {
    fn of(value: Option<&Value>) -> Self {
        let (kind, text) = match value {
            None | Some(Value::Null) => (KeyKind::Null, "null".to_string()),
            Some(Value::Bool(b)) => (KeyKind::Bool, b.to_string()),
            Some(Value::Number(n)) => (KeyKind::Number, n.to_string()),
            Some(Value::String(s)) => (KeyKind::String, s.clone()),
            Some(other) => (KeyKind::Json, other.to_string()),
        };
        Self { kind, text }
    }
}

/// Output names handed out per container. The first kind to use a text
/// gets it verbatim, later kinds get `text#kind`.
#[derive(Default)]
struct Claims(HashMap<(Vec<HierarchyKey>, String), KeyKind>);

impl Claims {
    fn name(&mut self, parent: Vec<HierarchyKey>, key: &HierarchyKey) -> String {
        let owner = self.0.entry((parent, key.text.clone())).or_insert(key.kind);
        if *owner == key.kind {
            key.text.clone()
        } else {
            format!("{}#{}", key.text, key.kind)
        }
    }
}

struct Open {
    key: HierarchyKey,
    object: Row,
}

/// Rough serialized size of a JSON value in bytes.
fn estimate(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|v| estimate(v) + 1).sum::<usize>(),
        Value::Object(map) => 2 + map.iter().map(|(k, v)| k.len() + 4 + estimate(v)).sum::<usize>(),
    }
}

/// Running size of the response against the configured bound.
struct SizeGuard {
    limit_mb: usize,
    used: usize,
}

impl SizeGuard {
    fn new(limit_mb: usize) -> Self {
        Self { limit_mb, used: 0 }
    }

    fn add(&mut self, column: &str, value: &Value) -> Result<()> {
        self.used += column.len() + 4 + estimate(value);
        if self.limit_mb > 0 && self.used > self.limit_mb.saturating_mul(1024 * 1024) {
            return Err(QueryError::ResponseTooLarge {
                limit_mb: self.limit_mb,
            });
        }
        Ok(())
    }
}

/// Build the tree in a single pass over `rows`.
pub fn build_tree(rows: &[Row], schema: &Schema, config: &ResultBuilderConfig) -> Result<Value> {
    let plan = Plan::new(schema, config)?;
    let hierarchy: HashSet<&str> = config.hierarchy.iter().map(String::as_str).collect();
    let mut size = SizeGuard::new(config.max_size_mb);

    if plan.levels.is_empty() {
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = Row::new();
            for (column, value) in row {
                if value.is_null() && !config.show_null {
                    continue;
                }
                size.add(column, value)?;
                let merge = plan.places.get(column.as_str()).is_some_and(|p| p.merge);
                put(&mut object, column, value.clone(), merge);
            }
            items.push(Value::Object(object));
        }
        return Ok(Value::Array(items));
    }

    let mut root = Row::new();
    let mut claims = Claims::default();
    let mut stack: Vec<Open> = Vec::with_capacity(plan.levels.len());

    for row in rows {
        let keys: Vec<HierarchyKey> = plan
            .levels
            .iter()
            .map(|level| HierarchyKey::of(row.get(level.key_column)))
            .collect();

        let keep = stack
            .iter()
            .zip(&keys)
            .take_while(|(open, key)| open.key == **key)
            .count();
        while stack.len() > keep {
            close_top(&mut stack, &mut root, &plan, &mut claims);
        }
        while stack.len() < plan.levels.len() {
            stack.push(Open {
                key: keys[stack.len()].clone(),
                object: Row::new(),
            });
        }

        let mut leaf = Row::new();
        for (column, value) in row {
            let column = column.as_str();
            if hierarchy.contains(column)
                || plan.dropped.contains(column)
                || (value.is_null() && !config.show_null)
            {
                continue;
            }
            size.add(column, value)?;
            let place = plan.places.get(column).copied().unwrap_or(Place {
                level: plan.innermost(),
                merge: false,
            });
            let target = match stack.get_mut(place.level) {
                Some(open) => &mut open.object,
                None => &mut leaf,
            };
            put(target, column, value.clone(), place.merge);
        }

        if let (Some(field), Some(top)) = (plan.leaf_field, stack.last_mut()) {
            let items = top
                .object
                .entry(field)
                .or_insert_with(|| Value::Array(Vec::new()));
            if let (Value::Array(items), false) = (items, leaf.is_empty()) {
                items.push(Value::Object(leaf));
            }
        }
    }
    while !stack.is_empty() {
        close_top(&mut stack, &mut root, &plan, &mut claims);
    }

    debug!(rows = rows.len(), roots = root.len(), bytes = size.used, "result tree built");
    Ok(Value::Object(root))
}

fn put(object: &mut Row, column: &str, value: Value, merge: bool) {
    match object.get_mut(column) {
        Some(existing) if merge && !existing.is_null() => {}
        Some(existing) => *existing = value,
        None => {
            object.insert(column.to_string(), value);
        }
    }
}

/// Move the innermost open container into its parent.
fn close_top(stack: &mut Vec<Open>, root: &mut Row, plan: &Plan, claims: &mut Claims) {
    let Some(open) = stack.pop() else {
        return;
    };
    let depth = stack.len();
    let name = claims.name(stack.iter().map(|o| o.key.clone()).collect(), &open.key);
    let parent = match stack.last_mut() {
        None => root,
        Some(parent) => {
            let field = plan.levels[depth - 1].child_field.unwrap_or_default();
            let children = parent
                .object
                .entry(field)
                .or_insert_with(|| Value::Object(Map::new()));
            match children {
                Value::Object(children) => children,
                _ => return,
            }
        }
    };
    match parent.get_mut(&name) {
        Some(existing) => merge_values(existing, Value::Object(open.object)),
        None => {
            parent.insert(name, Value::Object(open.object));
        }
    }
}

/// Merge a container that was opened again for an already seen key.
fn merge_values(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, value) in new {
                match old.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        old.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => old.extend(new),
        (slot, value) => {
            if slot.is_null() {
                *slot = value;
            }
        }
    }
}

/// Renames aliased columns of union branches back to their public name.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    aliases: HashMap<String, String>,
    ignore_null: bool,
}

impl RowNormalizer {
    pub fn new(schema: &Schema, ignore_null: bool) -> Self {
        Self {
            aliases: schema.name_to_alias_map(),
            ignore_null,
        }
    }

    /// `None` if nothing is left of the row.
    pub fn normalize(&self, row: Row) -> Option<Row> {
        let mut out = Row::new();
        for (column, value) in row {
            if self.ignore_null && value.is_null() {
                continue;
            }
            match self.aliases.get(&column) {
                None => {
                    out.insert(column, value);
                }
                Some(alias) => match out.get_mut(alias) {
                    Some(existing) => {
                        if existing.is_null() && !value.is_null() {
                            *existing = value;
                        }
                    }
                    None => {
                        out.insert(alias.clone(), value);
                    }
                },
            }
        }
        (!out.is_empty()).then_some(out)
    }

    pub fn normalize_all(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().filter_map(|row| self.normalize(row)).collect()
    }
}
