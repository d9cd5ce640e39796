//! Relationship descriptors and the fields that hold related entities.
//!
//! Descriptors are declared by each [`Entity`] and validated when the
//! registry is built. Relationship fields are [`Related`] (to-one) and
//! [`RelatedMany`] (to-many); the session reaches them through the
//! type-erased [`RelationSlot`] interface so that one code path can fill any
//! relationship of any entity.

use std::any::{Any, TypeId};
use std::fmt;

use serde::{Serialize, Serializer};

use crate::entity::Entity;
use crate::error::Error;
use crate::value::Value;
use crate::Result;

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one: a `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Post`s belong to one `User`.
    ManyToOne,
    /// One-to-many: one `User` has many `Post`s.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the relationship yields a collection.
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }
}

/// When related entities are loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Loaded together with the owning entity.
    Eager,
    /// Only the foreign-key handle is kept; loaded on explicit request.
    #[default]
    Lazy,
}

/// Link table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTable {
    pub table: &'static str,
    /// Column referencing the owning entity's primary key.
    pub local_column: &'static str,
    /// Column referencing the target entity's primary key.
    pub remote_column: &'static str,
}

impl LinkTable {
    pub const fn new(
        table: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table,
            local_column,
            remote_column,
        }
    }
}

/// How the two tables of a relationship are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSpec {
    /// Foreign key column on the owning entity's table, referencing the target's primary key.
    Local(&'static str),
    /// Foreign key column on the target's table, referencing the owner's primary key.
    Remote(&'static str),
    /// Association through a link table.
    Table(LinkTable),
}

/// Relationship descriptor declared by an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDef {
    /// Relationship (field) name, used to address the slot on the entity.
    pub name: &'static str,
    pub kind: RelationshipKind,
    pub target: TypeId,
    pub target_name: &'static str,
    pub join: JoinSpec,
    pub fetch: FetchPolicy,
    /// Save and delete the related entities together with the owner.
    pub cascade: bool,
}

impl RelationshipDef {
    fn new<T: Entity>(name: &'static str, kind: RelationshipKind, join: JoinSpec) -> Self {
        Self {
            name,
            kind,
            target: TypeId::of::<T>(),
            target_name: T::entity_name(),
            join,
            fetch: FetchPolicy::Lazy,
            cascade: false,
        }
    }

    /// Many-to-one through `local_column` on the owner's table.
    pub fn many_to_one<T: Entity>(name: &'static str, local_column: &'static str) -> Self {
        Self::new::<T>(name, RelationshipKind::ManyToOne, JoinSpec::Local(local_column))
    }

    /// One-to-many through `remote_column` on the target's table.
    pub fn one_to_many<T: Entity>(name: &'static str, remote_column: &'static str) -> Self {
        Self::new::<T>(name, RelationshipKind::OneToMany, JoinSpec::Remote(remote_column))
    }

    /// One-to-one; the foreign key may live on either side.
    pub fn one_to_one<T: Entity>(name: &'static str, join: JoinSpec) -> Self {
        Self::new::<T>(name, RelationshipKind::OneToOne, join)
    }

    pub fn many_to_many<T: Entity>(name: &'static str, link: LinkTable) -> Self {
        Self::new::<T>(name, RelationshipKind::ManyToMany, JoinSpec::Table(link))
    }

    pub fn eager(mut self) -> Self {
        self.fetch = FetchPolicy::Eager;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.fetch = FetchPolicy::Lazy;
        self
    }

    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.fetch == FetchPolicy::Eager
    }
}

/// A boxed entity of a type known only through its metadata.
pub type AnyEntity = Box<dyn Any + Send + Sync>;

/// Object-safe view of an entity, used when cascading over related objects.
pub trait ErasedEntity: Send + Sync {
    fn entity_type(&self) -> TypeId;

    fn erased_name(&self) -> &'static str;

    /// Field values keyed by field name.
    fn erased_values(&self) -> Vec<(&'static str, Value)>;

    #[allow(clippy::result_large_err)]
    fn erased_set_primary_key(&mut self, key: &Value) -> Result<()>;

    fn erased_relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot>;
}

impl<E: Entity> ErasedEntity for E {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn erased_name(&self) -> &'static str {
        E::entity_name()
    }

    fn erased_values(&self) -> Vec<(&'static str, Value)> {
        self.to_row()
    }

    fn erased_set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.set_primary_key(key)
    }

    fn erased_relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        self.relation_mut(name)
    }
}

/// Type-erased access to a relationship field.
pub trait RelationSlot: Send + Sync {
    /// Foreign-key handle of a to-one relationship.
    fn key(&self) -> Option<&Value>;

    fn set_key(&mut self, key: Value);

    fn is_loaded(&self) -> bool;

    /// Install fetched entities. Every item must be of the target type.
    fn fill(&mut self, items: Vec<AnyEntity>) -> Result<()>;

    /// Entities currently held by the slot.
    fn members(&self) -> Vec<&dyn ErasedEntity>;

    fn members_mut(&mut self) -> Vec<&mut dyn ErasedEntity>;
}

fn downcast<T: Entity>(item: AnyEntity) -> Result<T> {
    item.downcast::<T>().map(|b| *b).map_err(|_| {
        Error::mapping(
            T::entity_name(),
            None,
            "related entity has an unexpected type",
        )
    })
}

/// A related single entity (many-to-one or one-to-one).
///
/// States: empty (no key, not loaded), unloaded (key known, not fetched),
/// loaded (fetched; possibly loaded as absent).
pub struct Related<T: Entity> {
    fk_value: Option<Value>,
    loaded: Option<Option<T>>,
}

impl<T: Entity> Related<T> {
    pub const fn empty() -> Self {
        Self {
            fk_value: None,
            loaded: None,
        }
    }

    /// Create from a foreign key value (not yet loaded).
    pub fn from_fk(fk: impl Into<Value>) -> Self {
        let fk = fk.into();
        Self {
            fk_value: (!fk.is_null()).then_some(fk),
            loaded: None,
        }
    }

    pub fn loaded(obj: T) -> Self {
        Self {
            fk_value: None,
            loaded: Some(Some(obj)),
        }
    }

    /// Get the loaded entity (None if not loaded or loaded as absent).
    pub fn get(&self) -> Option<&T> {
        self.loaded.as_ref().and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.loaded.as_mut().and_then(|o| o.as_mut())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.fk_value.is_none() && self.get().is_none()
    }

    pub fn fk(&self) -> Option<&Value> {
        self.fk_value.as_ref()
    }

    pub fn set_loaded(&mut self, obj: Option<T>) {
        self.loaded = Some(obj);
    }

    pub fn take(&mut self) -> Option<T> {
        self.loaded.take().flatten()
    }
}

impl<T: Entity> RelationSlot for Related<T> {
    fn key(&self) -> Option<&Value> {
        self.fk_value.as_ref()
    }

    fn set_key(&mut self, key: Value) {
        self.fk_value = (!key.is_null()).then_some(key);
    }

    fn is_loaded(&self) -> bool {
        Related::is_loaded(self)
    }

    fn fill(&mut self, items: Vec<AnyEntity>) -> Result<()> {
        if items.len() > 1 {
            return Err(Error::mapping(
                T::entity_name(),
                None,
                format!("to-one relationship matched {} rows", items.len()),
            ));
        }
        let obj = items.into_iter().next().map(downcast::<T>).transpose()?;
        self.loaded = Some(obj);
        Ok(())
    }

    fn members(&self) -> Vec<&dyn ErasedEntity> {
        self.get()
            .map(|e| vec![e as &dyn ErasedEntity])
            .unwrap_or_default()
    }

    fn members_mut(&mut self) -> Vec<&mut dyn ErasedEntity> {
        self.get_mut()
            .map(|e| vec![e as &mut dyn ErasedEntity])
            .unwrap_or_default()
    }
}

impl<T: Entity> Default for Related<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity + Clone> Clone for Related<T> {
    fn clone(&self) -> Self {
        Self {
            fk_value: self.fk_value.clone(),
            loaded: self.loaded.clone(),
        }
    }
}

impl<T: Entity + PartialEq> PartialEq for Related<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fk_value == other.fk_value && self.loaded == other.loaded
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_loaded() {
            "loaded"
        } else if self.fk_value.is_none() {
            "empty"
        } else {
            "unloaded"
        };
        f.debug_struct("Related")
            .field("state", &state)
            .field("fk_value", &self.fk_value)
            .field("loaded", &self.get())
            .finish()
    }
}

impl<T> Serialize for Related<T>
where
    T: Entity + Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.get() {
            Some(obj) => obj.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}

/// A collection of related entities (one-to-many or many-to-many).
pub struct RelatedMany<T: Entity> {
    loaded: Option<Vec<T>>,
}

impl<T: Entity> RelatedMany<T> {
    pub const fn unloaded() -> Self {
        Self { loaded: None }
    }

    pub fn loaded(items: Vec<T>) -> Self {
        Self {
            loaded: Some(items),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn get(&self) -> Option<&[T]> {
        self.loaded.as_deref()
    }

    /// Number of loaded entities (0 if not loaded).
    pub fn len(&self) -> usize {
        self.loaded.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_loaded(&mut self, items: Vec<T>) {
        self.loaded = Some(items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.loaded.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.loaded.iter_mut().flatten()
    }
}

impl<T: Entity> RelationSlot for RelatedMany<T> {
    fn key(&self) -> Option<&Value> {
        None
    }

    fn set_key(&mut self, _key: Value) {}

    fn is_loaded(&self) -> bool {
        RelatedMany::is_loaded(self)
    }

    fn fill(&mut self, items: Vec<AnyEntity>) -> Result<()> {
        let items = items
            .into_iter()
            .map(downcast::<T>)
            .collect::<Result<Vec<_>>>()?;
        self.loaded = Some(items);
        Ok(())
    }

    fn members(&self) -> Vec<&dyn ErasedEntity> {
        self.iter().map(|e| e as &dyn ErasedEntity).collect()
    }

    fn members_mut(&mut self) -> Vec<&mut dyn ErasedEntity> {
        self.iter_mut().map(|e| e as &mut dyn ErasedEntity).collect()
    }
}

impl<T: Entity> Default for RelatedMany<T> {
    fn default() -> Self {
        Self::unloaded()
    }
}

impl<T: Entity + Clone> Clone for RelatedMany<T> {
    fn clone(&self) -> Self {
        Self {
            loaded: self.loaded.clone(),
        }
    }
}

impl<T: Entity + PartialEq> PartialEq for RelatedMany<T> {
    fn eq(&self, other: &Self) -> bool {
        self.loaded == other.loaded
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for RelatedMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedMany")
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl<T> Serialize for RelatedMany<T>
where
    T: Entity + Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.loaded {
            Some(items) => items.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}
