//! Entity metadata and the startup-time registry.
//!
//! A [`RegistryBuilder`] collects entity declarations during initialization.
//! [`RegistryBuilder::build`] validates cross-entity references and freezes
//! the result into a [`Registry`], which has no mutation API and is shared by
//! reference (usually behind an `Arc`) with every other component.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::entity::{ColumnDef, Entity};
use crate::error::{Error, RegistrationError, RegistrationErrorKind};
use crate::identifiers::is_valid_identifier;
use crate::mapper::Mapper;
use crate::relationship::{AnyEntity, JoinSpec, RelationshipDef, RelationshipKind};
use crate::row::Row;

type DecodeFn = fn(&Row, &EntityMetadata) -> Result<AnyEntity>;

/// Immutable mapping of one entity type to its table.
pub struct EntityMetadata {
    entity_type: TypeId,
    entity_name: &'static str,
    table: String,
    columns: Vec<ColumnDef>,
    primary_key: usize,
    relationships: Vec<RelationshipDef>,
    decode: DecodeFn,
}

impl EntityMetadata {
    pub fn entity_type(&self) -> TypeId {
        self.entity_type
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &ColumnDef {
        &self.columns[self.primary_key]
    }

    pub fn primary_key_index(&self) -> usize {
        self.primary_key
    }

    pub fn relationships(&self) -> &[RelationshipDef] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Find a column by field name or column name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.field == name)
            .or_else(|| self.columns.iter().find(|c| c.column == name))
    }

    pub fn column_by_name(&self, column: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.column == column)
    }

    /// Build an instance of the described type from a column-keyed row.
    pub fn decode(&self, row: &Row) -> Result<AnyEntity> {
        (self.decode)(row, self)
    }

    fn describe<E: Entity>() -> std::result::Result<Self, RegistrationError> {
        let name = E::entity_name();
        let table = E::table_name();
        let columns = E::columns();
        let relationships = E::relationships();

        let fail = |kind, message: String| RegistrationError::new(name, kind, message);

        if !is_valid_identifier(&table) {
            return Err(fail(
                RegistrationErrorKind::InvalidIdentifier,
                format!("invalid table name '{}'", table),
            ));
        }
        if columns.is_empty() {
            return Err(fail(
                RegistrationErrorKind::MissingPrimaryKey,
                "entity declares no columns".to_string(),
            ));
        }

        for (i, col) in columns.iter().enumerate() {
            if !is_valid_identifier(col.column) {
                return Err(fail(
                    RegistrationErrorKind::InvalidIdentifier,
                    format!("invalid column name '{}'", col.column),
                ));
            }
            if columns[..i]
                .iter()
                .any(|c| c.column == col.column || c.field == col.field)
            {
                return Err(fail(
                    RegistrationErrorKind::DuplicateColumn,
                    format!("column '{}' declared twice", col.column),
                ));
            }
            if !col.kind.accepts(col.sql_type) {
                return Err(fail(
                    RegistrationErrorKind::UnsupportedColumnType,
                    format!(
                        "field '{}' ({:?}) cannot map column type {}",
                        col.field,
                        col.kind,
                        col.sql_type.sql_name()
                    ),
                ));
            }
        }

        let mut keys = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i);
        let primary_key = match (keys.next(), keys.next()) {
            (Some(i), None) => i,
            (None, _) => {
                return Err(fail(
                    RegistrationErrorKind::MissingPrimaryKey,
                    "exactly one primary key column is required".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(fail(
                    RegistrationErrorKind::MultiplePrimaryKeys,
                    "exactly one primary key column is required".to_string(),
                ));
            }
        };
        if columns[primary_key].nullable {
            return Err(fail(
                RegistrationErrorKind::MissingPrimaryKey,
                "primary key column cannot be nullable".to_string(),
            ));
        }

        for (i, rel) in relationships.iter().enumerate() {
            if relationships[..i].iter().any(|r| r.name == rel.name) {
                return Err(fail(
                    RegistrationErrorKind::InvalidRelationship,
                    format!("relationship '{}' declared twice", rel.name),
                ));
            }
            let join_fits = match (rel.kind, rel.join) {
                (RelationshipKind::ManyToOne, JoinSpec::Local(_))
                | (RelationshipKind::OneToMany, JoinSpec::Remote(_))
                | (RelationshipKind::ManyToMany, JoinSpec::Table(_))
                | (RelationshipKind::OneToOne, JoinSpec::Local(_) | JoinSpec::Remote(_)) => true,
                _ => false,
            };
            if !join_fits {
                return Err(fail(
                    RegistrationErrorKind::InvalidRelationship,
                    format!("{:?} relationship '{}' cannot use {:?}", rel.kind, rel.name, rel.join),
                ));
            }
            match rel.join {
                JoinSpec::Local(col) => {
                    if !columns.iter().any(|c| c.column == col) {
                        return Err(fail(
                            RegistrationErrorKind::InvalidRelationship,
                            format!("relationship '{}' joins on unmapped column '{}'", rel.name, col),
                        ));
                    }
                }
                JoinSpec::Remote(col) => {
                    if !is_valid_identifier(col) {
                        return Err(fail(
                            RegistrationErrorKind::InvalidIdentifier,
                            format!("invalid join column '{}'", col),
                        ));
                    }
                }
                JoinSpec::Table(link) => {
                    for ident in [link.table, link.local_column, link.remote_column] {
                        if !is_valid_identifier(ident) {
                            return Err(fail(
                                RegistrationErrorKind::InvalidIdentifier,
                                format!("invalid link table identifier '{}'", ident),
                            ));
                        }
                    }
                }
            }
        }

        Ok(Self {
            entity_type: TypeId::of::<E>(),
            entity_name: name,
            table,
            columns,
            primary_key,
            relationships,
            decode: decode_as::<E>,
        })
    }
}

fn decode_as<E: Entity>(row: &Row, meta: &EntityMetadata) -> Result<AnyEntity> {
    Mapper::to_entity::<E>(row, meta).map(|e| Box::new(e) as AnyEntity)
}

impl std::fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("entity_name", &self.entity_name)
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("primary_key", &self.primary_key)
            .field("relationships", &self.relationships)
            .finish_non_exhaustive()
    }
}

/// Collects entity declarations during initialization.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<TypeId, Arc<EntityMetadata>>,
    order: Vec<TypeId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. Registering a type again is a no-op.
    #[allow(clippy::result_large_err)]
    pub fn register<E: Entity>(&mut self) -> Result<&mut Self> {
        if self.entries.contains_key(&TypeId::of::<E>()) {
            tracing::debug!(entity = E::entity_name(), "entity already registered, skipping");
            return Ok(self);
        }
        self.insert::<E>()
    }

    /// Register an entity type, failing with `DuplicateRegistration` on repeat.
    #[allow(clippy::result_large_err)]
    pub fn register_strict<E: Entity>(&mut self) -> Result<&mut Self> {
        if self.entries.contains_key(&TypeId::of::<E>()) {
            return Err(RegistrationError::new(
                E::entity_name(),
                RegistrationErrorKind::DuplicateRegistration,
                "entity registered twice",
            )
            .into());
        }
        self.insert::<E>()
    }

    #[allow(clippy::result_large_err)]
    fn insert<E: Entity>(&mut self) -> Result<&mut Self> {
        let meta = EntityMetadata::describe::<E>()?;
        tracing::debug!(
            entity = meta.entity_name,
            table = %meta.table,
            columns = meta.columns.len(),
            relationships = meta.relationships.len(),
            "registered entity"
        );
        self.order.push(meta.entity_type);
        self.entries.insert(meta.entity_type, Arc::new(meta));
        Ok(self)
    }

    /// Validate cross-entity references and freeze the registry.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Registry> {
        let mut by_table: HashMap<String, TypeId> = HashMap::with_capacity(self.entries.len());
        for id in &self.order {
            let meta = &self.entries[id];
            if by_table.insert(meta.table.clone(), *id).is_some() {
                return Err(RegistrationError::new(
                    meta.entity_name,
                    RegistrationErrorKind::DuplicateRegistration,
                    format!("table '{}' is mapped by more than one entity", meta.table),
                )
                .into());
            }
            for rel in &meta.relationships {
                let Some(target) = self.entries.get(&rel.target) else {
                    return Err(RegistrationError::new(
                        meta.entity_name,
                        RegistrationErrorKind::UnknownRelationshipTarget,
                        format!(
                            "relationship '{}' targets unregistered entity {}",
                            rel.name, rel.target_name
                        ),
                    )
                    .into());
                };
                if let JoinSpec::Remote(col) = rel.join {
                    if target.column_by_name(col).is_none() {
                        return Err(RegistrationError::new(
                            meta.entity_name,
                            RegistrationErrorKind::InvalidRelationship,
                            format!(
                                "relationship '{}' joins on '{}', which {} does not map",
                                rel.name, col, target.entity_name
                            ),
                        )
                        .into());
                    }
                }
            }
        }

        tracing::info!(entities = self.entries.len(), "entity registry initialized");
        Ok(Registry {
            entries: self.entries,
            by_table,
        })
    }
}

/// Process-wide, read-only entity metadata.
#[derive(Debug)]
pub struct Registry {
    entries: HashMap<TypeId, Arc<EntityMetadata>>,
    by_table: HashMap<String, TypeId>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Metadata for `E`, or `UnregisteredEntity`.
    #[allow(clippy::result_large_err)]
    pub fn lookup<E: Entity>(&self) -> Result<&EntityMetadata> {
        self.entries
            .get(&TypeId::of::<E>())
            .map(Arc::as_ref)
            .ok_or_else(|| Error::unregistered(E::entity_name()))
    }

    /// Metadata by type identity; `name` is only used for the error.
    #[allow(clippy::result_large_err)]
    pub fn lookup_type(&self, id: TypeId, name: &str) -> Result<&EntityMetadata> {
        self.entries
            .get(&id)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::unregistered(name))
    }

    pub fn lookup_table(&self, table: &str) -> Option<&EntityMetadata> {
        self.by_table
            .get(table)
            .and_then(|id| self.entries.get(id))
            .map(Arc::as_ref)
    }

    pub fn contains<E: Entity>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<E>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entries.values().map(Arc::as_ref)
    }
}
