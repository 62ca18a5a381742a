//! Table processing order.
//!
//! A table whose discriminator columns are foreign keys can only be matched
//! against existing rows once the referenced tables have populated the
//! foreign key map. Referenced tables are moved ahead of everything else,
//! with a single level of tie-breaking between them.

use crate::mapping::MappingLookup;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Discriminator foreign-key dependencies: table -> tables its
/// discriminator columns reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscriminatorDeps {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DiscriminatorDeps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect dependencies of `tables` from their discriminator and
    /// foreign-key declarations.
    pub fn collect<'a>(
        tables: impl IntoIterator<Item = &'a str>,
        mapping: &(impl MappingLookup + ?Sized),
    ) -> Self {
        let foreign_keys = mapping.foreign_keys();
        let mut deps = Self::new();
        for table in tables {
            for column in mapping.discriminators(table) {
                if let Some(target) = foreign_keys.get(&format!("{}.{}", table, column)) {
                    deps.add(table, target);
                }
            }
        }
        deps
    }

    pub fn add(&mut self, table: &str, referenced: &str) {
        self.deps
            .entry(table.to_string())
            .or_default()
            .insert(referenced.to_string());
    }

    /// Tables referenced by any discriminator foreign key.
    pub fn referenced(&self) -> BTreeSet<&str> {
        self.deps
            .values()
            .flat_map(|targets| targets.iter().map(String::as_str))
            .collect()
    }

    pub fn of(&self, table: &str) -> impl Iterator<Item = &str> {
        self.deps
            .get(table)
            .into_iter()
            .flat_map(|targets| targets.iter().map(String::as_str))
    }
}

/// Order `tables` for processing.
///
/// Referenced tables come first, in input order, except those whose own
/// discriminators reference another referenced table: these follow the
/// rest of the referenced group. Remaining tables keep their input order.
/// The property table, if present, always goes last.
pub fn order_tables(
    tables: &[String],
    deps: &DiscriminatorDeps,
    property_table: Option<&str>,
) -> Vec<String> {
    let referenced = deps.referenced();
    let is_property = |t: &str| property_table == Some(t);

    let mut front = Vec::new();
    let mut back = Vec::new();
    let mut rest = Vec::new();
    let mut last = Vec::new();

    for table in tables {
        if is_property(table) {
            last.push(table.clone());
        } else if !referenced.contains(table.as_str()) {
            rest.push(table.clone());
        } else if deps
            .of(table)
            .any(|dep| dep != table && referenced.contains(dep))
        {
            back.push(table.clone());
        } else {
            front.push(table.clone());
        }
    }

    for table in &back {
        for dep in deps.of(table) {
            if dep != table && back.iter().any(|b| b == dep) {
                warn!(
                    "discriminator dependency {} -> {} is deeper than one level, \
                     processing order may leave it unresolved",
                    table, dep
                );
            }
        }
    }
    for table in &referenced {
        if !tables.iter().any(|t| t == table) {
            debug!("{}: referenced by a discriminator but not migrated", table);
        }
    }

    front.into_iter().chain(back).chain(rest).chain(last).collect()
}

/// Schedule `tables` using the mapping's declarations.
pub fn schedule<'a>(
    tables: &[String],
    destination_tables: impl IntoIterator<Item = &'a str>,
    mapping: &(impl MappingLookup + ?Sized),
    property_table: Option<&str>,
) -> Vec<String> {
    let deps = DiscriminatorDeps::collect(destination_tables, mapping);
    order_tables(tables, &deps, property_table)
}
