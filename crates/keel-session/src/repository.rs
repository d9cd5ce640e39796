//! The public entry point: one operation, one unit of work.
//!
//! Each [`Repository`] operation acquires a connection, begins a
//! transaction, runs, commits, and releases the connection. Transient
//! failures (pool exhaustion, dropped connections, deadlocks and
//! serialization failures) restart the whole unit of work with exponential
//! backoff, up to the [`RetryPolicy`] limit. Nothing is retried in the
//! middle of a transaction.

use std::sync::Arc;

use asupersync::time::sleep;
use asupersync::{Cx, Outcome};
use keel_core::{Entity, Error, Registry, RetryPolicy, Value, clock_now};
use keel_pool::{Connector, Pool};
use keel_query::{Arg, PageRequest, QuerySpec};

use crate::page::Page;
use crate::session::Session;
use crate::unit_of_work::UnitOfWork;

/// Run `$body` (an `Outcome`-valued expression using `$uow`) in a fresh
/// unit of work, committing on success and retrying transient failures.
macro_rules! in_unit_of_work {
    ($repo:expr, $cx:expr, $op:expr, |$uow:ident| $body:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match $repo.begin($cx).await {
                Outcome::Ok(mut $uow) => {
                    let result = $body;
                    match result {
                        Outcome::Ok(value) => match $uow.commit($cx).await {
                            Outcome::Ok(()) => Outcome::Ok(value),
                            Outcome::Err(e) => Outcome::Err(e),
                            Outcome::Cancelled(r) => Outcome::Cancelled(r),
                            Outcome::Panicked(p) => Outcome::Panicked(p),
                        },
                        other => {
                            // still open only after NotFound
                            if let Outcome::Err(e) = $uow.rollback($cx).await {
                                tracing::warn!(operation = $op, error = %e, "rollback failed");
                            }
                            other
                        }
                    }
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
            match outcome {
                Outcome::Err(e) if $repo.should_retry(&e, attempt) => {
                    let delay = $repo.retry.backoff(attempt);
                    tracing::warn!(
                        operation = $op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying unit of work"
                    );
                    sleep(clock_now(), delay).await;
                }
                other => break other,
            }
        }
    }};
}

fn map_ok<T, U>(outcome: Outcome<T, Error>, f: impl FnOnce(T) -> U) -> Outcome<U, Error> {
    match outcome {
        Outcome::Ok(v) => Outcome::Ok(f(v)),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Entity operations over a connection pool.
///
/// Cheap to clone; clones share the pool and the registry.
pub struct Repository<K: Connector> {
    pool: Pool<K>,
    registry: Arc<Registry>,
    retry: RetryPolicy,
}

impl<K: Connector> Clone for Repository<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: Arc::clone(&self.registry),
            retry: self.retry,
        }
    }
}

impl<K: Connector> std::fmt::Debug for Repository<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("pool", &self.pool)
            .field("entities", &self.registry.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl<K: Connector> Repository<K> {
    pub fn new(pool: Pool<K>, registry: Arc<Registry>) -> Self {
        Self {
            pool,
            registry,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy (use [`RetryPolicy::none`] to disable retries).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &Pool<K> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.retry.max_attempts
    }

    /// Open a caller-managed unit of work.
    ///
    /// The caller decides when to [`commit`](UnitOfWork::commit) or
    /// [`rollback`](UnitOfWork::rollback); dropping it uncommitted discards
    /// the transaction.
    pub async fn begin(&self, cx: &Cx) -> Outcome<UnitOfWork<K>, Error> {
        let conn = match self.pool.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut session = Session::new(conn);
        match session.begin(cx).await {
            Outcome::Ok(()) => Outcome::Ok(UnitOfWork::new(session, Arc::clone(&self.registry))),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Insert `entity` (and its cascaded relationships) and return it with
    /// its generated key.
    pub async fn save<E: Entity + Clone>(&self, cx: &Cx, entity: E) -> Outcome<E, Error> {
        in_unit_of_work!(self, cx, "save", |uow| {
            // a retried attempt starts again from the caller's unsaved value
            let mut attempt_entity = entity.clone();
            map_ok(uow.save(cx, &mut attempt_entity).await, |()| attempt_entity)
        })
    }

    /// The entity with primary key `id`, or `NotFound`.
    pub async fn find_by_id<E: Entity>(&self, cx: &Cx, id: impl Into<Value>) -> Outcome<E, Error> {
        let id = id.into();
        in_unit_of_work!(self, cx, "find_by_id", |uow| uow
            .find_by_id::<E>(cx, id.clone())
            .await)
    }

    pub async fn find_all<E: Entity>(&self, cx: &Cx, spec: &QuerySpec) -> Outcome<Vec<E>, Error> {
        in_unit_of_work!(self, cx, "find_all", |uow| uow.find_all::<E>(cx, spec).await)
    }

    pub async fn find_page<E: Entity>(
        &self,
        cx: &Cx,
        spec: &QuerySpec,
        request: &PageRequest,
    ) -> Outcome<Page<E>, Error> {
        in_unit_of_work!(self, cx, "find_page", |uow| uow
            .find_page::<E>(cx, spec, request)
            .await)
    }

    pub async fn count<E: Entity>(&self, cx: &Cx, spec: &QuerySpec) -> Outcome<u64, Error> {
        in_unit_of_work!(self, cx, "count", |uow| uow.count::<E>(cx, spec).await)
    }

    pub async fn exists_by_id<E: Entity>(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<bool, Error> {
        let id = id.into();
        in_unit_of_work!(self, cx, "exists_by_id", |uow| uow
            .exists_by_id::<E>(cx, id.clone())
            .await)
    }

    /// Run a derived finder, e.g. `find_by::<User>(cx, "findByEmailIgnoreCase", args)`.
    pub async fn find_by<E: Entity>(
        &self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<Vec<E>, Error> {
        in_unit_of_work!(self, cx, "find_by", |uow| uow
            .find_by::<E>(cx, finder, args.clone())
            .await)
    }

    pub async fn count_by<E: Entity>(
        &self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<u64, Error> {
        in_unit_of_work!(self, cx, "count_by", |uow| uow
            .count_by::<E>(cx, finder, args.clone())
            .await)
    }

    pub async fn exists_by<E: Entity>(
        &self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<bool, Error> {
        in_unit_of_work!(self, cx, "exists_by", |uow| uow
            .exists_by::<E>(cx, finder, args.clone())
            .await)
    }

    pub async fn delete_by<E: Entity>(
        &self,
        cx: &Cx,
        finder: &str,
        args: Vec<Arg>,
    ) -> Outcome<u64, Error> {
        in_unit_of_work!(self, cx, "delete_by", |uow| uow
            .delete_by::<E>(cx, finder, args.clone())
            .await)
    }

    /// Write `entity` to its row and return it.
    pub async fn update<E: Entity>(&self, cx: &Cx, entity: E) -> Outcome<E, Error> {
        let outcome = in_unit_of_work!(self, cx, "update", |uow| uow.update(cx, &entity).await);
        map_ok(outcome, |()| entity)
    }

    pub async fn delete<E: Entity>(&self, cx: &Cx, id: impl Into<Value>) -> Outcome<(), Error> {
        let id = id.into();
        in_unit_of_work!(self, cx, "delete", |uow| uow.delete::<E>(cx, id.clone()).await)
    }

    pub async fn delete_entity<E: Entity>(&self, cx: &Cx, entity: &E) -> Outcome<(), Error> {
        in_unit_of_work!(self, cx, "delete_entity", |uow| uow
            .delete_entity(cx, entity)
            .await)
    }

    /// Fetch the lazy relationship `name` into `entity`.
    pub async fn load_relationship<E: Entity>(
        &self,
        cx: &Cx,
        entity: &mut E,
        name: &str,
    ) -> Outcome<(), Error> {
        in_unit_of_work!(self, cx, "load_relationship", |uow| uow
            .load_relationship(cx, entity, name)
            .await)
    }

    /// Fetch the relationship `name` into every entity of `entities` in one statement.
    pub async fn load_relationships<E: Entity>(
        &self,
        cx: &Cx,
        entities: &mut [E],
        name: &str,
    ) -> Outcome<(), Error> {
        in_unit_of_work!(self, cx, "load_relationships", |uow| uow
            .load_relationships(cx, entities, name)
            .await)
    }
}
