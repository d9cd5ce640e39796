//! Core types and traits for Keel.
//!
//! This crate provides the foundations the other Keel crates build on:
//!
//! - `Value` and `Row` for parameters and results
//! - `Entity`, `ColumnDef` and relationship descriptors for declaring mappings
//! - `Registry` / `EntityMetadata`, the immutable metadata built at startup
//! - `Mapper` for row/entity translation
//! - `Connection` trait and `Dialect` rendering strategy
//! - `DatabaseConfig` and the `Error` taxonomy
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod config;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod identifiers;
pub mod mapper;
pub mod metadata;
pub mod relationship;
pub mod retry;
pub mod row;
pub mod types;
pub mod value;

pub use config::DatabaseConfig;
pub use connection::Connection;
pub use dialect::{Dialect, KeyRetrieval};
pub use entity::{ColumnDef, Entity};
pub use error::{
    ConnectionError, ConnectionErrorKind, DatabaseError, Error, MappingError, NotFound,
    PersistenceError, PersistenceErrorKind, PoolError, PoolErrorKind, QueryError, QueryErrorKind,
    RegistrationError, RegistrationErrorKind, Result, TransactionError, TransactionErrorKind,
};
pub use identifiers::{camel_to_snake, is_valid_identifier};
pub use mapper::Mapper;
pub use metadata::{EntityMetadata, Registry, RegistryBuilder};
pub use relationship::{
    AnyEntity, ErasedEntity, FetchPolicy, JoinSpec, LinkTable, Related, RelatedMany, RelationSlot,
    RelationshipDef, RelationshipKind,
};
pub use retry::{RetryPolicy, clock_now};
pub use row::Row;
pub use types::{FieldKind, SqlType};
pub use value::{FromValue, KeyValue, Value};

/// Unwrap an `Outcome::Ok`, returning any other outcome from the enclosing function.
///
/// `Err` values are converted with `From`, so `Result`-returning helpers can
/// be used inside `Outcome`-returning async functions via [`Outcome::Err`].
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(::core::convert::From::from(e)),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result`, returning `Outcome::Err` from the enclosing function on failure.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(v) => v,
            ::core::result::Result::Err(e) => {
                return $crate::Outcome::Err(::core::convert::From::from(e));
            }
        }
    };
}
