//! Filling relationship slots from query results.
//!
//! To-one relationships planned as joins are decoded from the aliased
//! columns of the owner's own row. Collections (and explicit loads) use one
//! follow-up statement per relationship for the whole batch of owners, and
//! rows are matched back to owners by key. Related entities are never
//! loaded past this first level, so cyclic relationship graphs terminate.

use std::collections::HashMap;

use asupersync::{Cx, Outcome};
use keel_core::{
    AnyEntity, Entity, EntityMetadata, ErasedEntity, Error, KeyValue, Mapper, Registry,
    RelationshipDef, Result, Row, Value, try_outcome, try_result,
};
use keel_pool::Connector;
use keel_query::{FetchPlan, MatchKey, OWNER_KEY_ALIAS, OwnerKey, SelectStatement, owner_key_side};

use crate::unit_of_work::{UnitOfWork, field_value};

impl<K: Connector> UnitOfWork<K> {
    /// Run `select` and build its entities with their planned relationships.
    pub(crate) async fn materialize<E: Entity>(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        select: &SelectStatement,
    ) -> Outcome<Vec<E>, Error> {
        let rows = try_outcome!(self.session.query(cx, &select.statement).await);
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entity: E = try_result!(Mapper::to_entity(row, meta));
            try_result!(fill_joined(&self.registry, &select.plan, row, &mut entity));
            entities.push(entity);
        }

        for name in &select.plan.deferred {
            let Some(rel) = meta.relationship(name) else {
                continue;
            };
            let mut owners: Vec<&mut dyn ErasedEntity> = entities
                .iter_mut()
                .map(|e| e as &mut dyn ErasedEntity)
                .collect();
            try_outcome!(self.fetch_related(cx, meta, rel, &mut owners).await);
        }
        Outcome::Ok(entities)
    }

    /// Load `rel` for every owner with one statement.
    pub(crate) async fn fetch_related(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        rel: &RelationshipDef,
        owners: &mut [&mut dyn ErasedEntity],
    ) -> Outcome<(), Error> {
        let key_field = match owner_key_side(rel) {
            OwnerKey::PrimaryKey => meta.primary_key().field,
            OwnerKey::Column(column) => match meta.column_by_name(column) {
                Some(col) => col.field,
                None => {
                    return Outcome::Err(Error::mapping(
                        meta.entity_name(),
                        Some(column),
                        "relationship column is not mapped",
                    ));
                }
            },
        };
        let keys: Vec<Value> = owners
            .iter()
            .map(|owner| field_value(&owner.erased_values(), key_field))
            .collect();

        let target = try_result!(self.registry.lookup_type(rel.target, rel.target_name));
        let fetch = try_result!(self.builder.related(&self.registry, rel, &keys));

        let mut groups: HashMap<KeyValue, Vec<Row>> = HashMap::new();
        if let Some(fetch) = fetch {
            let rows = try_outcome!(self.session.query(cx, &fetch.statement).await);
            for row in rows {
                let owner_key = match fetch.match_key {
                    MatchKey::TargetKey => try_result!(Mapper::primary_key_of(&row, target)),
                    MatchKey::RemoteColumn(column) => {
                        row.get_by_name(column).cloned().unwrap_or(Value::Null)
                    }
                    MatchKey::OwnerColumn => row
                        .get_by_name(OWNER_KEY_ALIAS)
                        .cloned()
                        .unwrap_or(Value::Null),
                };
                if let Some(key) = owner_key.to_key() {
                    groups.entry(key).or_default().push(row);
                }
            }
        }

        let mut matched = 0usize;
        for (owner, key) in owners.iter_mut().zip(&keys) {
            let rows = key
                .to_key()
                .and_then(|k| groups.get(&k))
                .map_or(&[][..], Vec::as_slice);
            let items = try_result!(decode_all(target, rows));
            matched += items.len();
            if let Some(slot) = owner.erased_relation_mut(rel.name) {
                try_result!(slot.fill(items));
            }
        }

        tracing::debug!(
            owner = meta.entity_name(),
            relationship = rel.name,
            owners = owners.len(),
            matched,
            "loaded relationship"
        );
        Outcome::Ok(())
    }
}

/// Decode the joined to-one relationships of one result row into `entity`.
#[allow(clippy::result_large_err)]
fn fill_joined(
    registry: &Registry,
    plan: &FetchPlan,
    row: &Row,
    entity: &mut dyn ErasedEntity,
) -> Result<()> {
    for join in &plan.joins {
        let target = registry.lookup_type(join.target, join.target_name)?;
        let items = match Mapper::extract_joined(row, target, &join.alias) {
            Some(joined) => vec![target.decode(&joined)?],
            None => Vec::new(),
        };
        if let Some(slot) = entity.erased_relation_mut(join.relationship) {
            slot.fill(items)?;
        }
    }
    Ok(())
}

// Each owner gets its own instances; rows shared by several owners are decoded once per owner.
#[allow(clippy::result_large_err)]
fn decode_all(target: &EntityMetadata, rows: &[Row]) -> Result<Vec<AnyEntity>> {
    rows.iter().map(|row| target.decode(row)).collect()
}
