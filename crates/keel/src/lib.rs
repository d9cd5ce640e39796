//! Keel: metadata-driven object-relational mapping for MySQL and PostgreSQL.
//!
//! Keel maps plain Rust types onto relational tables:
//!
//! - entities declare their table, columns and relationships once, and the
//!   [`Registry`] validates and freezes those declarations at startup
//! - the [`QueryBuilder`] renders parameterized SQL for either dialect from
//!   registered metadata only
//! - the [`Pool`] bounds the number of open connections and validates them
//!   on checkout
//! - the [`Repository`] runs each operation in its own transaction and
//!   retries transient failures
//!
//! Wire drivers plug in by implementing [`Connection`] and [`Connector`].
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! struct User {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Entity for User {
//!     const TABLE_NAME: &'static str = "users";
//!
//!     fn columns() -> Vec<ColumnDef> {
//!         vec![
//!             ColumnDef::new("id", SqlType::BigInt, FieldKind::I64).primary_key().generated(),
//!             ColumnDef::new("name", SqlType::VarChar(80), FieldKind::Text),
//!         ]
//!     }
//!
//!     fn to_row(&self) -> Vec<(&'static str, Value)> {
//!         vec![("id", self.id.into()), ("name", self.name.clone().into())]
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Self { id: row.get_named("id")?, name: row.get_named("name")? })
//!     }
//!
//!     fn set_primary_key(&mut self, key: &Value) -> Result<()> {
//!         self.id = key.as_i64();
//!         Ok(())
//!     }
//! }
//!
//! async fn example(cx: &Cx, connector: impl Connector) {
//!     let mut registry = Registry::builder();
//!     registry.register::<User>().unwrap();
//!     let registry = Arc::new(registry.build().unwrap());
//!
//!     let config = DatabaseConfig::from_url("postgres://app@localhost/app").unwrap();
//!     let pool = Pool::new(connector, PoolConfig::from(&config));
//!     let users = Repository::new(pool, registry);
//!
//!     let saved = users.save(cx, User { id: None, name: "Ana".into() }).await;
//!     let found: Outcome<User, Error> = users.find_by_id(cx, 1_i64).await;
//! }
//! ```

pub use keel_core::{
    AnyEntity, ColumnDef, Connection, ConnectionError, ConnectionErrorKind, Cx, DatabaseConfig,
    DatabaseError, Dialect, Entity, EntityMetadata, ErasedEntity, Error, FetchPolicy,
    FieldKind, FromValue, JoinSpec, KeyRetrieval, KeyValue, LinkTable, Mapper,
    MappingError, NotFound, Outcome, PersistenceError, PersistenceErrorKind, PoolError,
    PoolErrorKind, QueryError, QueryErrorKind, Registry, RegistryBuilder, RegistrationError,
    RegistrationErrorKind, Related, RelatedMany, RelationSlot, RelationshipDef, RelationshipKind,
    Result, RetryPolicy, Row, SqlType, TransactionError, TransactionErrorKind, Value,
};

pub use keel_query::{
    Arg, BoundStatement, Comparator, Connective, DerivedQuery, Direction, Filter, FetchPlan,
    InsertStatement, Operand, Operation, Order, PageRequest, QueryBuilder, QuerySpec,
    SelectStatement, Sort, Subject, escape_like,
};

pub use keel_pool::{Connector, Pool, PoolConfig, PoolStats, PooledConnection};

pub use keel_session::{Page, Repository, Session, TransactionState, UnitOfWork};

/// Build a [`Repository`] over a new pool sized from `config`.
pub fn repository<K: Connector>(
    connector: K,
    config: &DatabaseConfig,
    registry: std::sync::Arc<Registry>,
) -> Repository<K> {
    Repository::new(Pool::new(connector, PoolConfig::from(config)), registry)
}

/// Everything needed to declare entities and run repository operations.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        Arg, ColumnDef, Connection, Connector, Cx, DatabaseConfig, Dialect, Entity, Error,
        FieldKind, Filter, LinkTable, Order, Outcome, Page, PageRequest, Pool, PoolConfig,
        QuerySpec, Registry, Related, RelatedMany, RelationSlot, RelationshipDef, Repository,
        Result, RetryPolicy, Row, Sort, SqlType, UnitOfWork, Value,
    };
}
