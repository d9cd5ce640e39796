//! Translation between result rows and entities.
//!
//! Database rows are keyed by column name and carry driver representations;
//! entity rows are keyed by field name and carry the canonical representation
//! of each field's [`FieldKind`](crate::types::FieldKind).

use std::sync::Arc;

use crate::Result;
use crate::entity::{ColumnDef, Entity};
use crate::error::Error;
use crate::metadata::EntityMetadata;
use crate::relationship::JoinSpec;
use crate::row::{ColumnInfo, Row};
use crate::value::Value;

/// Alias given to a joined column: `{prefix}__{column}`.
pub fn column_alias(prefix: &str, column: &str) -> String {
    format!("{}__{}", prefix, column)
}

/// Stateless row/entity translation driven by metadata.
pub struct Mapper;

impl Mapper {
    /// Build an entity from a row keyed by column name.
    ///
    /// Missing columns, unconvertible cells, a null primary key, and nulls in
    /// non-nullable columns are reported as `MappingError`. Foreign-key
    /// handles of local to-one relationships are filled from the row.
    #[allow(clippy::result_large_err)]
    pub fn to_entity<E: Entity>(row: &Row, meta: &EntityMetadata) -> Result<E> {
        let values = Self::canonical_values(row, meta)?;
        let field_row = Self::field_row(meta, values.clone());
        let mut entity = E::from_row(&field_row).map_err(|e| match e {
            Error::Type(te) => Error::mapping(meta.entity_name(), te.column.as_deref(), te.to_string()),
            other => other,
        })?;

        for rel in meta.relationships() {
            if let JoinSpec::Local(col) = rel.join {
                let key = meta
                    .columns()
                    .iter()
                    .position(|c| c.column == col)
                    .map_or(Value::Null, |i| values[i].clone());
                if let Some(slot) = entity.relation_mut(rel.name) {
                    slot.set_key(key);
                }
            }
        }
        Ok(entity)
    }

    /// Field values of `entity` in column order, ready to bind.
    ///
    /// Generated columns may be null (the database assigns them); any other
    /// null in a non-nullable column is a `MappingError`.
    #[allow(clippy::result_large_err)]
    pub fn to_row<E: Entity>(entity: &E, meta: &EntityMetadata) -> Result<Vec<Value>> {
        let fields = entity.to_row();
        Self::bind_values(&fields, meta)
    }

    /// Same as [`Mapper::to_row`] for field values obtained without the concrete type.
    #[allow(clippy::result_large_err)]
    pub fn bind_values(fields: &[(&'static str, Value)], meta: &EntityMetadata) -> Result<Vec<Value>> {
        meta.columns()
            .iter()
            .map(|col| {
                let raw = fields
                    .iter()
                    .find(|(name, _)| *name == col.field)
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        Error::mapping(meta.entity_name(), Some(col.field), "entity did not supply a value")
                    })?;
                let value = Self::coerce(col, raw, meta)?;
                if value.is_null() && !col.nullable && !col.generated {
                    return Err(Error::mapping(
                        meta.entity_name(),
                        Some(col.field),
                        "null value for non-nullable column",
                    ));
                }
                Ok(value)
            })
            .collect()
    }

    /// Wrap values in column order into a row keyed by column name.
    pub fn column_row(meta: &EntityMetadata, values: Vec<Value>) -> Row {
        let names = meta.columns().iter().map(|c| c.column.to_string()).collect();
        Row::new(names, values)
    }

    /// Extract the aliased columns of a joined entity.
    ///
    /// Returns `None` when the joined primary key is null (no matching row
    /// on the outer side of a LEFT JOIN).
    pub fn extract_joined(row: &Row, meta: &EntityMetadata, prefix: &str) -> Option<Row> {
        let pk_alias = column_alias(prefix, meta.primary_key().column);
        match row.get_by_name(&pk_alias) {
            None | Some(Value::Null) => return None,
            Some(_) => {}
        }
        let values = meta
            .columns()
            .iter()
            .map(|c| {
                row.get_by_name(&column_alias(prefix, c.column))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();
        Some(Self::column_row(meta, values))
    }

    /// The primary key value of a column-keyed row, canonicalized.
    #[allow(clippy::result_large_err)]
    pub fn primary_key_of(row: &Row, meta: &EntityMetadata) -> Result<Value> {
        let pk = meta.primary_key();
        let raw = row.get_by_name(pk.column).ok_or_else(|| {
            Error::mapping(meta.entity_name(), Some(pk.column), "primary key missing from row")
        })?;
        let value = Self::coerce(pk, raw, meta)?;
        if value.is_null() {
            return Err(Error::mapping(meta.entity_name(), Some(pk.column), "primary key is null"));
        }
        Ok(value)
    }

    #[allow(clippy::result_large_err)]
    fn canonical_values(row: &Row, meta: &EntityMetadata) -> Result<Vec<Value>> {
        let pk_index = meta.primary_key_index();
        meta.columns()
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let raw = row.get_by_name(col.column).ok_or_else(|| {
                    Error::mapping(meta.entity_name(), Some(col.column), "column missing from result row")
                })?;
                let value = Self::coerce(col, raw, meta)?;
                if value.is_null() {
                    if i == pk_index {
                        return Err(Error::mapping(
                            meta.entity_name(),
                            Some(col.column),
                            "primary key is null in result row",
                        ));
                    }
                    if !col.nullable {
                        return Err(Error::mapping(
                            meta.entity_name(),
                            Some(col.column),
                            "null in non-nullable column",
                        ));
                    }
                }
                Ok(value)
            })
            .collect()
    }

    #[allow(clippy::result_large_err)]
    fn coerce(col: &ColumnDef, raw: &Value, meta: &EntityMetadata) -> Result<Value> {
        col.kind.coerce(raw).ok_or_else(|| {
            Error::mapping(
                meta.entity_name(),
                Some(col.column),
                format!("cannot read {} as {:?}", raw.type_name(), col.kind),
            )
        })
    }

    fn field_row(meta: &EntityMetadata, values: Vec<Value>) -> Row {
        let names = meta.columns().iter().map(|c| c.field.to_string()).collect();
        Row::with_columns(Arc::new(ColumnInfo::new(names)), values)
    }
}
