//! Entity operations inside one transaction.
//!
//! A [`UnitOfWork`] binds a [`Session`] to the registry and the statement
//! builder. Every operation runs in the session's transaction; a failure
//! (other than `NotFound`) rolls the transaction back at once, after which
//! only dropping the unit of work is useful.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use keel_core::{
    Entity, EntityMetadata, ErasedEntity, Error, JoinSpec, Mapper, PersistenceError,
    PersistenceErrorKind, QueryErrorKind, Registry, Value, try_outcome, try_result,
};
use keel_pool::Connector;
use keel_query::{Arg, DerivedQuery, Filter, PageRequest, QueryBuilder, QuerySpec, Subject};

use crate::page::Page;
use crate::session::{Session, TransactionState};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One transaction's worth of entity operations.
pub struct UnitOfWork<K: Connector> {
    pub(crate) session: Session<K>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) builder: QueryBuilder,
}

impl<K: Connector> UnitOfWork<K> {
    /// Wrap a session whose transaction has already begun.
    pub fn new(session: Session<K>, registry: Arc<Registry>) -> Self {
        let builder = QueryBuilder::new(session.dialect());
        Self {
            session,
            registry,
            builder,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session<K> {
        &self.session
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Commit and release the connection.
    pub async fn commit(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.session.commit(cx).await
    }

    /// Roll back and release the connection.
    pub async fn rollback(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.session.rollback(cx).await
    }

    /// Insert `entity`, store its generated key, and cascade to its owned
    /// relationships.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn save<E: Entity>(&mut self, cx: &Cx, entity: &mut E) -> Outcome<(), Error> {
        let outcome = async {
            try_result!(self.session.ensure_active());
            let meta = try_result!(self.registry.lookup::<E>());
            try_outcome!(self.persist(cx, meta, entity, None).await);
            Outcome::Ok(())
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Fetch one entity by primary key, with its eager relationships.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn find_by_id<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<E, Error> {
        let id = id.into();
        let outcome = async {
            try_result!(self.session.ensure_active());
            let meta = try_result!(self.registry.lookup::<E>());
            let select = try_result!(self.builder.select_by_id(&self.registry, meta, id.clone()));
            let found: Vec<E> = try_outcome!(self.materialize(cx, meta, &select).await);
            match found.into_iter().next() {
                Some(entity) => Outcome::Ok(entity),
                None => Outcome::Err(Error::not_found(meta.entity_name(), id)),
            }
        }
        .await;
        self.settle(cx, outcome).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn find_all<E: Entity>(
        &mut self,
        cx: &Cx,
        spec: &QuerySpec,
    ) -> Outcome<Vec<E>, Error> {
        let outcome = self.select_all::<E>(cx, spec).await;
        self.settle(cx, outcome).await
    }

    /// One page of the entities matching `spec`, plus the total count.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name(), page = request.page))]
    pub async fn find_page<E: Entity>(
        &mut self,
        cx: &Cx,
        spec: &QuerySpec,
        request: &PageRequest,
    ) -> Outcome<Page<E>, Error> {
        let outcome = async {
            let total = try_outcome!(self.count_matching::<E>(cx, spec).await);
            let paged = spec.clone().page(request);
            let content = try_outcome!(self.select_all::<E>(cx, &paged).await);
            Outcome::Ok(Page::new(content, request, total))
        }
        .await;
        self.settle(cx, outcome).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn count<E: Entity>(&mut self, cx: &Cx, spec: &QuerySpec) -> Outcome<u64, Error> {
        let outcome = self.count_matching::<E>(cx, spec).await;
        self.settle(cx, outcome).await
    }

    pub async fn exists_by_id<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<bool, Error> {
        let id = id.into();
        let outcome = async {
            let meta = try_result!(self.registry.lookup::<E>());
            let spec = QuerySpec::count().filter(Filter::eq(meta.primary_key().field, id));
            let n = try_outcome!(self.count_matching::<E>(cx, &spec).await);
            Outcome::Ok(n > 0)
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Run a derived finder such as `findByNameAndAgeGreaterThan`.
    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(entity = E::entity_name()))]
    pub async fn find_by<E: Entity>(
        &mut self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<Vec<E>, Error> {
        let outcome = async {
            let spec = try_result!(self.derive::<E>(finder, Subject::Find, args));
            self.select_all::<E>(cx, &spec).await
        }
        .await;
        self.settle(cx, outcome).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(entity = E::entity_name()))]
    pub async fn count_by<E: Entity>(
        &mut self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<u64, Error> {
        let outcome = async {
            let spec = try_result!(self.derive::<E>(finder, Subject::Count, args));
            self.count_matching::<E>(cx, &spec).await
        }
        .await;
        self.settle(cx, outcome).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(entity = E::entity_name()))]
    pub async fn exists_by<E: Entity>(
        &mut self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<bool, Error> {
        let outcome = async {
            let spec = try_result!(self.derive::<E>(finder, Subject::Exists, args));
            let n = try_outcome!(self.count_matching::<E>(cx, &spec).await);
            Outcome::Ok(n > 0)
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Bulk delete through a derived finder. Relationship cascades are not applied.
    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(entity = E::entity_name()))]
    pub async fn delete_by<E: Entity>(
        &mut self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<u64, Error> {
        let outcome = async {
            try_result!(self.session.ensure_active());
            let spec = try_result!(self.derive::<E>(finder, Subject::Delete, args));
            let meta = try_result!(self.registry.lookup::<E>());
            let statement = try_result!(self.builder.delete(meta, &spec));
            self.session.execute(cx, &statement).await
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Write every column of `entity` to the row with its primary key.
    ///
    /// A missing key is a `MissingKey` persistence error; a key matching no
    /// row is `NotFound`. Relationships are not cascaded.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn update<E: Entity>(&mut self, cx: &Cx, entity: &E) -> Outcome<(), Error> {
        let outcome = async {
            try_result!(self.session.ensure_active());
            let meta = try_result!(self.registry.lookup::<E>());
            let values = try_result!(Mapper::to_row(entity, meta));
            let statement = try_result!(self.builder.update(meta, &values));
            let affected = try_outcome!(self.session.execute(cx, &statement).await);
            if affected == 0 {
                let key = values[meta.primary_key_index()].clone();
                return Outcome::Err(Error::not_found(meta.entity_name(), key));
            }
            Outcome::Ok(())
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Delete the entity with primary key `id`, cascading first.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::entity_name()))]
    pub async fn delete<E: Entity>(&mut self, cx: &Cx, id: impl Into<Value>) -> Outcome<(), Error> {
        let id = id.into();
        let outcome = async {
            try_result!(self.session.ensure_active());
            let meta = try_result!(self.registry.lookup::<E>());
            self.remove(cx, meta, id).await
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Delete `entity` by its primary key.
    pub async fn delete_entity<E: Entity>(&mut self, cx: &Cx, entity: &E) -> Outcome<(), Error> {
        let outcome = async {
            try_result!(self.session.ensure_active());
            let meta = try_result!(self.registry.lookup::<E>());
            let key = key_of(meta, &entity.to_row());
            if key.is_null() {
                return Outcome::Err(missing_key(meta));
            }
            self.remove(cx, meta, key).await
        }
        .await;
        self.settle(cx, outcome).await
    }

    /// Load the relationship `name` into `entity`.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::entity_name()))]
    pub async fn load_relationship<E: Entity>(
        &mut self,
        cx: &Cx,
        entity: &mut E,
        name: &str,
    ) -> Outcome<(), Error> {
        let outcome = self
            .load_for::<E>(cx, std::slice::from_mut(entity), name)
            .await;
        self.settle(cx, outcome).await
    }

    /// Load the relationship `name` into every entity of `entities` with one statement.
    #[tracing::instrument(level = "debug", skip(self, cx, entities), fields(entity = E::entity_name(), owners = entities.len()))]
    pub async fn load_relationships<E: Entity>(
        &mut self,
        cx: &Cx,
        entities: &mut [E],
        name: &str,
    ) -> Outcome<(), Error> {
        let outcome = self.load_for::<E>(cx, entities, name).await;
        self.settle(cx, outcome).await
    }

    async fn load_for<E: Entity>(
        &self,
        cx: &Cx,
        entities: &mut [E],
        name: &str,
    ) -> Outcome<(), Error> {
        try_result!(self.session.ensure_active());
        let meta = try_result!(self.registry.lookup::<E>());
        let Some(rel) = meta.relationship(name) else {
            return Outcome::Err(Error::query(
                QueryErrorKind::UnknownRelationship,
                format!("{} has no relationship '{}'", meta.entity_name(), name),
            ));
        };
        let mut owners: Vec<&mut dyn ErasedEntity> = entities
            .iter_mut()
            .map(|e| e as &mut dyn ErasedEntity)
            .collect();
        self.fetch_related(cx, meta, rel, &mut owners).await
    }

    async fn select_all<E: Entity>(&self, cx: &Cx, spec: &QuerySpec) -> Outcome<Vec<E>, Error> {
        try_result!(self.session.ensure_active());
        let meta = try_result!(self.registry.lookup::<E>());
        let select = try_result!(self.builder.select(&self.registry, meta, spec));
        self.materialize(cx, meta, &select).await
    }

    async fn count_matching<E: Entity>(&self, cx: &Cx, spec: &QuerySpec) -> Outcome<u64, Error> {
        try_result!(self.session.ensure_active());
        let meta = try_result!(self.registry.lookup::<E>());
        let statement = try_result!(self.builder.count(meta, spec));
        let rows = try_outcome!(self.session.query(cx, &statement).await);
        let count = rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok());
        match count {
            Some(n) => Outcome::Ok(n),
            None => Outcome::Err(Error::mapping(
                meta.entity_name(),
                None,
                "count query returned no number",
            )),
        }
    }

    #[allow(clippy::result_large_err)]
    fn derive<E: Entity>(
        &self,
        finder: &str,
        subject: Subject,
        args: Vec<Arg>,
    ) -> Result<QuerySpec, Error> {
        let meta = self.registry.lookup::<E>()?;
        DerivedQuery::parse(finder, meta)?
            .as_subject(subject)?
            .to_spec(args)
    }

    /// Insert one entity and its cascaded relationships.
    ///
    /// `parent` overrides the named column with the owner's key before the
    /// values are bound. Returns the entity's primary key.
    fn persist<'a>(
        &'a self,
        cx: &'a Cx,
        meta: &'a EntityMetadata,
        entity: &'a mut dyn ErasedEntity,
        parent: Option<(&'static str, Value)>,
    ) -> BoxFuture<'a, Outcome<Value, Error>> {
        Box::pin(async move {
            let mut fields = entity.erased_values();
            if let Some((column, owner_key)) = &parent {
                if let Some(col) = meta.column_by_name(column) {
                    match fields.iter_mut().find(|(f, _)| *f == col.field) {
                        Some(slot) => slot.1 = owner_key.clone(),
                        None => fields.push((col.field, owner_key.clone())),
                    }
                }
            }

            let values = try_result!(Mapper::bind_values(&fields, meta));
            let insert = try_result!(self.builder.insert(meta, &values));
            let generated = try_outcome!(self.session.insert(cx, &insert).await);
            let key = match generated {
                Some(raw) => {
                    let key = meta.primary_key().kind.coerce(&raw).unwrap_or(raw);
                    try_result!(entity.erased_set_primary_key(&key));
                    key
                }
                None => values[meta.primary_key_index()].clone(),
            };

            if let Some((column, owner_key)) = parent {
                // keep the child's back-reference handle in step with the row
                for rel in meta.relationships() {
                    if rel.join == JoinSpec::Local(column) {
                        if let Some(slot) = entity.erased_relation_mut(rel.name) {
                            slot.set_key(owner_key.clone());
                        }
                    }
                }
            }

            for rel in meta.relationships().iter().filter(|r| r.cascade) {
                let target = try_result!(self.registry.lookup_type(rel.target, rel.target_name));
                let Some(slot) = entity.erased_relation_mut(rel.name) else {
                    continue;
                };
                match rel.join {
                    JoinSpec::Remote(fk) => {
                        for child in slot.members_mut() {
                            try_outcome!(
                                self.persist(cx, target, child, Some((fk, key.clone()))).await
                            );
                        }
                    }
                    JoinSpec::Table(link) => {
                        for member in slot.members_mut() {
                            let existing = key_of(target, &member.erased_values());
                            let target_key = if existing.is_null() {
                                try_outcome!(self.persist(cx, target, member, None).await)
                            } else {
                                existing
                            };
                            let statement = self.builder.insert_link(&link, key.clone(), target_key);
                            try_outcome!(self.session.execute(cx, &statement).await);
                        }
                    }
                    // the owner's foreign key column was written with the owner itself
                    JoinSpec::Local(_) => {}
                }
            }

            tracing::trace!(entity = meta.entity_name(), key = %key, "persisted");
            Outcome::Ok(key)
        })
    }

    /// Delete the row keyed `id`, after the children and link rows of
    /// cascading relationships.
    async fn remove(&self, cx: &Cx, meta: &EntityMetadata, id: Value) -> Outcome<(), Error> {
        for rel in meta.relationships().iter().filter(|r| r.cascade) {
            match rel.join {
                JoinSpec::Remote(fk) => {
                    let target = try_result!(self.registry.lookup_type(rel.target, rel.target_name));
                    let spec = QuerySpec::delete().filter(Filter::eq(fk, id.clone()));
                    let statement = try_result!(self.builder.delete(target, &spec));
                    let removed = try_outcome!(self.session.execute(cx, &statement).await);
                    tracing::trace!(relationship = rel.name, removed, "cascaded delete");
                }
                JoinSpec::Table(link) => {
                    let statement = self.builder.delete_links(&link, id.clone());
                    try_outcome!(self.session.execute(cx, &statement).await);
                }
                JoinSpec::Local(_) => {}
            }
        }

        let statement = try_result!(self.builder.delete_by_id(meta, id.clone()));
        let affected = try_outcome!(self.session.execute(cx, &statement).await);
        if affected == 0 {
            return Outcome::Err(Error::not_found(meta.entity_name(), id));
        }
        Outcome::Ok(())
    }

    /// Roll back on failure; `NotFound` leaves the transaction usable.
    async fn settle<T>(&mut self, cx: &Cx, outcome: Outcome<T, Error>) -> Outcome<T, Error> {
        let failed = match &outcome {
            Outcome::Ok(_) => false,
            Outcome::Err(e) => !e.is_not_found(),
            Outcome::Cancelled(_) | Outcome::Panicked(_) => true,
        };
        if failed && self.session.is_active() {
            tracing::warn!("operation failed, rolling back unit of work");
            self.session.rollback_quietly(cx).await;
        }
        outcome
    }
}

impl<K: Connector> std::fmt::Debug for UnitOfWork<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Primary key value among an entity's field values (`Null` if absent).
pub(crate) fn key_of(meta: &EntityMetadata, fields: &[(&'static str, Value)]) -> Value {
    field_value(fields, meta.primary_key().field)
}

pub(crate) fn field_value(fields: &[(&'static str, Value)], field: &str) -> Value {
    fields
        .iter()
        .find(|(name, _)| *name == field)
        .map_or(Value::Null, |(_, v)| v.clone())
}

fn missing_key(meta: &EntityMetadata) -> Error {
    Error::Persistence(PersistenceError {
        kind: PersistenceErrorKind::MissingKey,
        code: None,
        message: format!("{} has no primary key value", meta.entity_name()),
        sql: None,
    })
}
