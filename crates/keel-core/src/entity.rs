//! The `Entity` trait and column declarations.
//!
//! An entity declares its table, columns and relationships in code; the
//! registry turns those declarations into immutable [`EntityMetadata`]
//! once at startup.
//!
//! [`EntityMetadata`]: crate::metadata::EntityMetadata

use crate::Result;
use crate::relationship::{RelationSlot, RelationshipDef};
use crate::row::Row;
use crate::types::{FieldKind, SqlType};
use crate::value::Value;

/// Declaration of one mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Name of the field on the entity
    pub field: &'static str,
    /// Name of the column in the table (defaults to the field name)
    pub column: &'static str,
    pub sql_type: SqlType,
    pub kind: FieldKind,
    pub primary_key: bool,
    pub nullable: bool,
    /// Value is assigned by the database (auto-increment, identity)
    pub generated: bool,
}

impl ColumnDef {
    pub const fn new(field: &'static str, sql_type: SqlType, kind: FieldKind) -> Self {
        Self {
            field,
            column: field,
            sql_type,
            kind,
            primary_key: false,
            nullable: false,
            generated: false,
        }
    }

    /// Map the field to a differently named column.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column = name;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// A domain type persisted as rows of one table.
///
/// Rows exchanged with the entity are keyed by *field* name; the mapper
/// translates between field names and column names using the metadata.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Table name. Empty means the lowercased entity name.
    const TABLE_NAME: &'static str = "";

    fn columns() -> Vec<ColumnDef>;

    fn relationships() -> Vec<RelationshipDef> {
        Vec::new()
    }

    /// Field values keyed by field name.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Build an instance from a row keyed by field name.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Store the key assigned by the database after an insert.
    #[allow(clippy::result_large_err)]
    fn set_primary_key(&mut self, key: &Value) -> Result<()>;

    /// Relationship field by relationship name.
    fn relation(&self, _name: &str) -> Option<&dyn RelationSlot> {
        None
    }

    fn relation_mut(&mut self, _name: &str) -> Option<&mut dyn RelationSlot> {
        None
    }

    /// Short type name used in metadata and error messages.
    fn entity_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Resolved table name.
    fn table_name() -> String {
        if Self::TABLE_NAME.is_empty() {
            Self::entity_name().to_lowercase()
        } else {
            Self::TABLE_NAME.to_string()
        }
    }
}
