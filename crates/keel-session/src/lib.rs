//! Sessions, units of work and repositories for Keel.
//!
//! `keel-session` is the **unit-of-work layer**. It ties a pooled connection,
//! the entity registry and the statement builder together so that every
//! operation runs inside exactly one transaction on exactly one connection.
//!
//! # Role In The Architecture
//!
//! - **Session**: the `Idle -> Active -> Committed | RolledBack` state machine
//!   around one [`PooledConnection`](keel_pool::PooledConnection).
//! - **Unit of work**: entity operations (save with cascades, finders,
//!   update, delete, relationship loading) inside one session.
//! - **Repository**: one unit of work per call, with bounded retry of
//!   transient failures.
//!
//! # Example
//!
//! ```ignore
//! let repo = Repository::new(pool, Arc::new(registry));
//!
//! let ana = unwrap_outcome(repo.save(&cx, User::new("Ana", "a@x.com")).await);
//! let same: User = unwrap_outcome(repo.find_by_id(&cx, ana.id).await);
//!
//! // Several operations in one transaction
//! let mut uow = unwrap_outcome(repo.begin(&cx).await);
//! uow.save(&cx, &mut post).await;
//! uow.update(&cx, &ana).await;
//! uow.commit(&cx).await;
//! ```

mod loader;
pub mod page;
pub mod repository;
pub mod session;
pub mod unit_of_work;

pub use page::Page;
pub use repository::Repository;
pub use session::{Session, TransactionState};
pub use unit_of_work::UnitOfWork;
