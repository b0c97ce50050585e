//! Declarative catalog of entity definitions and their fields.
//!
//! Fields refer to nested entities by name, so a [`Schema`] is an
//! index-based registry and self-referencing entities are plain lookups.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How the fields of a nested entity are folded into its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookUpType {
    /// Fields are merged into the owner object.
    Inline,
    /// Like `Inline`, but existing non-null values are kept.
    Merge,
    /// A keyed dictionary of objects.
    Map,
    /// An array of objects.
    List,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    Column {
        sql: String,
        sql_before: Option<String>,
        sql_after: Option<String>,
    },
    Nested {
        target: String,
        lookup: LookUpType,
    },
}

/// A single field of an entity definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDef {
    name: String,
    alias: Option<String>,
    kind: TargetKind,
}

impl TargetDef {
    pub fn column(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            kind: TargetKind::Column {
                sql: sql.into(),
                sql_before: None,
                sql_after: None,
            },
        }
    }

    pub fn nested(name: impl Into<String>, target: impl Into<String>, lookup: LookUpType) -> Self {
        Self {
            name: name.into(),
            alias: None,
            kind: TargetKind::Nested {
                target: target.into(),
                lookup,
            },
        }
    }

    /// Replace the public name. The original name is no longer resolvable.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Companion column emitted before this one. Ignored for nested fields.
    pub fn sql_before(mut self, sql: impl Into<String>) -> Self {
        if let TargetKind::Column { sql_before, .. } = &mut self.kind {
            *sql_before = Some(sql.into());
        }
        self
    }

    /// Companion column emitted after this one. Ignored for nested fields.
    pub fn sql_after(mut self, sql: impl Into<String>) -> Self {
        if let TargetKind::Column { sql_after, .. } = &mut self.kind {
            *sql_after = Some(sql.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The name clients use: the alias if set, the original name otherwise.
    pub fn public_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    pub fn column_sql(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Column { sql, .. } => Some(sql),
            TargetKind::Nested { .. } => None,
        }
    }

    pub fn nested_target(&self) -> Option<(&str, LookUpType)> {
        match &self.kind {
            TargetKind::Nested { target, lookup } => Some((target, *lookup)),
            TargetKind::Column { .. } => None,
        }
    }

    /// The select list entry of a column field, companions included.
    pub fn select_sql(&self) -> Option<String> {
        let TargetKind::Column {
            sql,
            sql_before,
            sql_after,
        } = &self.kind
        else {
            return None;
        };
        let mut parts = Vec::with_capacity(3);
        if let Some(before) = sql_before {
            parts.push(before.clone());
        }
        parts.push(format!("{} as {}", sql, self.public_name()));
        if let Some(after) = sql_after {
            parts.push(after.clone());
        }
        Some(parts.join(", "))
    }

    /// Output column names of the select list entry, companions included.
    /// A companion without an `as` alias has no usable name and is skipped.
    pub fn output_names<'a>(&'a self) -> Vec<&'a str> {
        let TargetKind::Column {
            sql_before,
            sql_after,
            ..
        } = &self.kind
        else {
            return Vec::new();
        };
        let companion = |sql: &'a Option<String>| -> Option<&'a str> {
            sql.as_deref()
                .and_then(|s| s.rsplit_once(" as "))
                .map(|(_, name)| name.trim())
        };
        let mut names = Vec::with_capacity(3);
        names.extend(companion(sql_before));
        names.push(self.public_name());
        names.extend(companion(sql_after));
        names
    }
}

/// A named, insertion-ordered list of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDefList {
    name: String,
    defs: Vec<TargetDef>,
}

impl TargetDefList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defs: Vec::new(),
        }
    }

    pub fn add(mut self, def: TargetDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn push(&mut self, def: TargetDef) {
        self.defs.push(def);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDef> {
        self.defs.iter()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Find a field by its public name.
    pub fn find(&self, public_name: &str) -> Option<&TargetDef> {
        self.defs.iter().find(|d| d.public_name() == public_name)
    }

    /// The first nested field with the given lookup kind.
    pub fn first_nested(&self, lookup: LookUpType) -> Option<&TargetDef> {
        self.defs
            .iter()
            .find(|d| matches!(d.nested_target(), Some((_, l)) if l == lookup))
    }
}

/// Registry of all entity definitions.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    lists: Vec<TargetDefList>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity definition. Names must be unique, and so must
    /// the public field names inside it.
    pub fn add(&mut self, list: TargetDefList) -> Result<()> {
        if self.index.contains_key(list.name()) {
            return Err(QueryError::Config(format!(
                "entity definition '{}' registered twice",
                list.name()
            )));
        }
        let mut seen = HashSet::new();
        for def in list.iter() {
            if !seen.insert(def.public_name()) {
                return Err(QueryError::Config(format!(
                    "field '{}' appears twice in '{}'",
                    def.public_name(),
                    list.name()
                )));
            }
        }
        self.index.insert(list.name().to_string(), self.lists.len());
        self.lists.push(list);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TargetDefList> {
        self.index.get(name).map(|&i| &self.lists[i])
    }

    pub fn get_or_err(&self, name: &str) -> Result<&TargetDefList> {
        self.get(name).ok_or_else(|| QueryError::UnknownDefinition {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDefList> {
        self.lists.iter()
    }

    /// Check that every nested field points at a registered entity.
    pub fn validate(&self) -> Result<()> {
        for list in &self.lists {
            for def in list.iter() {
                if let Some((target, _)) = def.nested_target() {
                    if !self.contains(target) {
                        return Err(QueryError::Config(format!(
                            "field '{}.{}' refers to unknown entity '{}'",
                            list.name(),
                            def.name(),
                            target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Original field name → alias, for every aliased field.
    pub fn name_to_alias_map(&self) -> HashMap<String, String> {
        self.lists
            .iter()
            .flat_map(|l| l.iter())
            .filter_map(|d| d.alias_name().map(|a| (d.name().to_string(), a.to_string())))
            .collect()
    }
}
