//! The transaction state machine around one pooled connection.
//!
//! ```text
//! Idle --begin--> Active --commit--> Committed
//!                   |
//!                   +--rollback / failed commit--> RolledBack
//! ```
//!
//! A session dropped while `Active` leaves its connection marked tainted, so
//! the pool rolls it back before handing it to anyone else.

use std::sync::atomic::{AtomicBool, Ordering};

use asupersync::{Cx, Outcome};
use keel_core::{
    Connection, Dialect, Error, KeyRetrieval, Row, TransactionError, TransactionErrorKind, Value,
};
use keel_pool::{Connector, PooledConnection};
use keel_query::{BoundStatement, InsertStatement};

/// Transaction state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connection held, no transaction opened yet
    Idle,
    Active,
    Committed,
    RolledBack,
}

/// Exclusive use of one pooled connection for one transaction.
pub struct Session<K: Connector> {
    conn: PooledConnection<K>,
    dialect: Dialect,
    state: TransactionState,
    /// A statement failed at the connection level; the connection is not reused
    broken: AtomicBool,
}

impl<K: Connector> Session<K> {
    pub fn new(conn: PooledConnection<K>) -> Self {
        let dialect = conn.dialect();
        Self {
            conn,
            dialect,
            state: TransactionState::Idle,
            broken: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// The underlying driver connection.
    pub fn connection(&self) -> &K::Conn {
        &self.conn
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn ensure_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: format!("no active transaction (state: {:?})", self.state),
            }))
        }
    }

    /// Open the transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state != TransactionState::Idle {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyFinished,
                message: format!("cannot begin a transaction in state {:?}", self.state),
            }));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        // tainted until the transaction is closed again
        self.conn.mark_tainted();
        match self.conn.execute(cx, self.dialect.begin_sql(), &[]).await {
            Outcome::Ok(_) => {
                self.state = TransactionState::Active;
                tracing::trace!(dialect = %self.dialect, "transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(self.classify(e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the transaction.
    ///
    /// A failed commit is followed by a rollback and the session ends up
    /// `RolledBack`. When the connection itself fails during COMMIT the
    /// transaction may already be durable, so the error is reported as
    /// [`TransactionErrorKind::CommitOutcomeUnknown`], which is never retried.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if let Some(reason) = cx.cancel_reason() {
            self.rollback_quietly(cx).await;
            return Outcome::Cancelled(reason);
        }

        match self.conn.execute(cx, self.dialect.commit_sql(), &[]).await {
            Outcome::Ok(_) => {
                self.state = TransactionState::Committed;
                self.conn.mark_clean();
                tracing::trace!("transaction committed");
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                let err = self.classify(e);
                tracing::warn!(error = %err, "commit failed, rolling back");
                self.rollback_quietly(cx).await;
                if err.is_connection_error() {
                    return Outcome::Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::CommitOutcomeUnknown,
                        message: format!("connection lost during commit: {err}"),
                    }));
                }
                Outcome::Err(err)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll the transaction back. Does nothing unless the session is `Active`.
    ///
    /// Runs even when `cx` has been cancelled.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.is_active() {
            return Outcome::Ok(());
        }
        let result = self.conn.execute(cx, self.dialect.rollback_sql(), &[]).await;
        self.state = TransactionState::RolledBack;
        match result {
            Outcome::Ok(_) => {
                self.conn.mark_clean();
                tracing::trace!("transaction rolled back");
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                // state of the server-side transaction is unknown
                self.broken.store(true, Ordering::Relaxed);
                Outcome::Err(self.classify(e))
            }
            Outcome::Cancelled(r) => {
                self.broken.store(true, Ordering::Relaxed);
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.broken.store(true, Ordering::Relaxed);
                Outcome::Panicked(p)
            }
        }
    }

    pub(crate) async fn rollback_quietly(&mut self, cx: &Cx) {
        if let Outcome::Err(e) = self.rollback(cx).await {
            tracing::warn!(error = %e, "rollback failed, discarding connection");
        }
    }

    /// Run a query and return all rows.
    pub async fn query(&self, cx: &Cx, statement: &BoundStatement) -> Outcome<Vec<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(sql = statement.sql(), params = statement.params().len(), "query");
        match self.conn.query(cx, statement.sql(), statement.params()).await {
            Outcome::Ok(rows) => {
                tracing::trace!(rows = rows.len(), "query returned");
                Outcome::Ok(rows)
            }
            Outcome::Err(e) => Outcome::Err(self.classify(e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, cx: &Cx, statement: &BoundStatement) -> Outcome<u64, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(sql = statement.sql(), params = statement.params().len(), "execute");
        match self.conn.execute(cx, statement.sql(), statement.params()).await {
            Outcome::Ok(n) => {
                tracing::trace!(affected = n, "execute returned");
                Outcome::Ok(n)
            }
            Outcome::Err(e) => Outcome::Err(self.classify(e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run an insert, returning the database-generated key if one was requested.
    pub async fn insert(&self, cx: &Cx, insert: &InsertStatement) -> Outcome<Option<Value>, Error> {
        let statement = &insert.statement;
        match insert.key_retrieval {
            None => match self.execute(cx, statement).await {
                Outcome::Ok(_) => Outcome::Ok(None),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Some(KeyRetrieval::Returning) => match self.query(cx, statement).await {
                Outcome::Ok(rows) => {
                    let key = rows.first().and_then(|row| row.get(0)).cloned();
                    match key {
                        Some(key) if !key.is_null() => Outcome::Ok(Some(key)),
                        _ => Outcome::Err(Error::mapping(
                            insert.entity,
                            None,
                            "insert returned no generated key",
                        )),
                    }
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Some(KeyRetrieval::LastInsertId) => {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                tracing::debug!(sql = statement.sql(), params = statement.params().len(), "insert");
                match self.conn.insert(cx, statement.sql(), statement.params()).await {
                    Outcome::Ok(id) => Outcome::Ok(Some(Value::BigInt(id))),
                    Outcome::Err(e) => Outcome::Err(self.classify(e)),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    fn classify(&self, err: Error) -> Error {
        let err = self.dialect.classify(err);
        if err.is_connection_error() {
            self.broken.store(true, Ordering::Relaxed);
        }
        err
    }
}

impl<K: Connector> std::fmt::Debug for Session<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.dialect)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Drop for Session<K> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            tracing::warn!("session dropped with an open transaction; connection will be rolled back");
            self.conn.mark_tainted();
        }
        if self.broken.load(Ordering::Relaxed) {
            self.conn.mark_broken();
        }
    }
}
