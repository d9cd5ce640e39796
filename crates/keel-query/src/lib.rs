//! Parameterized statement building for Keel.
//!
//! `keel-query` turns entity metadata plus a [`QuerySpec`] (or an entity's
//! column values) into a [`BoundStatement`]: SQL text with positional
//! placeholders and the ordered values bound to them.
//!
//! # Role In The Architecture
//!
//! - **Clauses**: [`Filter`], [`Sort`] and [`PageRequest`] describe what to fetch.
//! - **Builder**: [`QueryBuilder`] renders inserts, selects, counts, updates
//!   and deletes for one [`Dialect`](keel_core::Dialect).
//! - **Fetch planning**: [`FetchPlan`] decides which relationships are joined
//!   and which are loaded by batched follow-up statements.
//! - **Derived finders**: [`DerivedQuery`] parses `findByNameAndAge`-style names.
//!
//! Identifiers always come from registered metadata and are quoted for the
//! dialect; values are never spliced into SQL text.

pub mod builder;
pub mod clause;
pub mod derived;
pub mod eager;
pub mod query;
pub mod statement;

pub use builder::{InsertStatement, QueryBuilder, SelectStatement};
pub use clause::{
    Comparator, Connective, DEFAULT_PAGE_SIZE, Direction, Filter, Operand, Order, PageRequest,
    Sort, escape_like,
};
pub use derived::{Arg, DerivedQuery, Subject};
pub use eager::{
    FetchPlan, JoinedRelation, MatchKey, OWNER_KEY_ALIAS, OwnerKey, RelatedFetch, owner_key_side,
};
pub use query::{Operation, QuerySpec};
pub use statement::BoundStatement;
