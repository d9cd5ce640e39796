//! Relationship fetch planning.
//!
//! To-one relationships requested with a query are fetched through a
//! `LEFT JOIN` whose columns are aliased `j{n}__{column}`. Collections are
//! never joined (that would multiply owner rows); they are fetched with one
//! follow-up statement per relationship, batching every owner key into a
//! single `IN` list.

use std::any::TypeId;
use std::collections::HashSet;

use keel_core::mapper::column_alias;
use keel_core::{
    Dialect, EntityMetadata, Error, JoinSpec, KeyValue, QueryErrorKind, Registry, RelationshipDef,
    Result, Value,
};

use crate::statement::{BoundStatement, SqlWriter};

/// Column alias carrying the owner key in many-to-many follow-up fetches.
pub const OWNER_KEY_ALIAS: &str = "keel__owner";

/// A to-one relationship fetched through a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRelation {
    pub relationship: &'static str,
    /// Table alias and column alias prefix (`j0`, `j1`, ...)
    pub alias: String,
    pub target: TypeId,
    pub target_name: &'static str,
}

/// Which relationships of a query are joined and which are fetched afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
    pub joins: Vec<JoinedRelation>,
    /// Collection relationships loaded with a follow-up statement
    pub deferred: Vec<&'static str>,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.deferred.is_empty()
    }

    /// Plan the eager relationships of `meta` plus the named `includes`.
    #[allow(clippy::result_large_err)]
    pub fn for_entity(meta: &EntityMetadata, includes: &[String]) -> Result<Self> {
        for name in includes {
            if meta.relationship(name).is_none() {
                return Err(Error::query(
                    QueryErrorKind::UnknownRelationship,
                    format!("{} has no relationship '{}'", meta.entity_name(), name),
                ));
            }
        }

        let mut plan = Self::default();
        for rel in meta.relationships() {
            if !rel.is_eager() && !includes.iter().any(|n| n == rel.name) {
                continue;
            }
            if rel.kind.is_collection() {
                plan.deferred.push(rel.name);
            } else {
                plan.joins.push(JoinedRelation {
                    relationship: rel.name,
                    alias: format!("j{}", plan.joins.len()),
                    target: rel.target,
                    target_name: rel.target_name,
                });
            }
        }
        Ok(plan)
    }
}

/// Append `, "j0"."col" AS "j0__col", ...` for every column of the joined target.
pub(crate) fn write_join_columns(w: &mut SqlWriter, target: &EntityMetadata, alias: &str) {
    for col in target.columns() {
        w.push(", ")
            .qualified(alias, col.column)
            .push(" AS ")
            .ident(&column_alias(alias, col.column));
    }
}

/// Append ` LEFT JOIN "target" AS "j0" ON ...` for a to-one relationship.
pub(crate) fn write_join(
    w: &mut SqlWriter,
    owner: &EntityMetadata,
    rel: &RelationshipDef,
    target: &EntityMetadata,
    alias: &str,
) {
    w.push(" LEFT JOIN ")
        .ident(target.table())
        .push(" AS ")
        .ident(alias)
        .push(" ON ");
    match rel.join {
        JoinSpec::Local(fk) => {
            w.qualified(alias, target.primary_key().column)
                .push(" = ")
                .qualified(owner.table(), fk);
        }
        JoinSpec::Remote(fk) => {
            w.qualified(alias, fk)
                .push(" = ")
                .qualified(owner.table(), owner.primary_key().column);
        }
        // to-one joins never use a link table; rejected at registration
        JoinSpec::Table(_) => {
            w.push("1 = 0");
        }
    }
}

/// How rows of a follow-up fetch are matched back to their owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    /// Target primary key equals the owner's local foreign key
    TargetKey,
    /// The named target column equals the owner's primary key
    RemoteColumn(&'static str),
    /// The [`OWNER_KEY_ALIAS`] column carries the owner's primary key
    OwnerColumn,
}

/// Follow-up statement loading one relationship for a batch of owners.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedFetch {
    pub statement: BoundStatement,
    pub match_key: MatchKey,
}

/// Which owner value feeds the `IN` list of a relationship fetch.
pub fn owner_key_side(rel: &RelationshipDef) -> OwnerKey {
    match rel.join {
        JoinSpec::Local(col) => OwnerKey::Column(col),
        JoinSpec::Remote(_) | JoinSpec::Table(_) => OwnerKey::PrimaryKey,
    }
}

/// Owner value a relationship is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKey {
    PrimaryKey,
    /// Foreign key column on the owner's table
    Column(&'static str),
}

/// Build the statement loading `rel` for every owner key in `keys`.
///
/// Null and duplicate keys are dropped; returns `None` when nothing is left
/// to fetch.
#[allow(clippy::result_large_err)]
pub fn related_fetch(
    dialect: Dialect,
    registry: &Registry,
    rel: &RelationshipDef,
    keys: &[Value],
) -> Result<Option<RelatedFetch>> {
    let target = registry.lookup_type(rel.target, rel.target_name)?;
    let keys = distinct_keys(keys);
    if keys.is_empty() {
        return Ok(None);
    }

    let mut w = SqlWriter::new(dialect);
    w.push("SELECT ");
    write_columns(&mut w, target);
    let match_key = match rel.join {
        JoinSpec::Local(_) => {
            w.push(" FROM ")
                .ident(target.table())
                .push(" WHERE ")
                .qualified(target.table(), target.primary_key().column)
                .push(" IN ")
                .bind_list(keys);
            MatchKey::TargetKey
        }
        JoinSpec::Remote(fk) => {
            w.push(" FROM ")
                .ident(target.table())
                .push(" WHERE ")
                .qualified(target.table(), fk)
                .push(" IN ")
                .bind_list(keys);
            MatchKey::RemoteColumn(fk)
        }
        JoinSpec::Table(link) => {
            w.push(", ")
                .qualified(link.table, link.local_column)
                .push(" AS ")
                .ident(OWNER_KEY_ALIAS)
                .push(" FROM ")
                .ident(target.table())
                .push(" INNER JOIN ")
                .ident(link.table)
                .push(" ON ")
                .qualified(link.table, link.remote_column)
                .push(" = ")
                .qualified(target.table(), target.primary_key().column)
                .push(" WHERE ")
                .qualified(link.table, link.local_column)
                .push(" IN ")
                .bind_list(keys);
            MatchKey::OwnerColumn
        }
    };
    w.push(" ORDER BY ")
        .qualified(target.table(), target.primary_key().column)
        .push(" ASC");

    Ok(Some(RelatedFetch {
        statement: w.finish(),
        match_key,
    }))
}

/// Append the qualified columns of `meta`'s own table.
pub(crate) fn write_columns(w: &mut SqlWriter, meta: &EntityMetadata) {
    for (i, col) in meta.columns().iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.qualified(meta.table(), col.column);
    }
}

fn distinct_keys(keys: &[Value]) -> Vec<Value> {
    let mut seen: HashSet<KeyValue> = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|k| k.to_key().is_some_and(|key| seen.insert(key)))
        .cloned()
        .collect()
}
