//! Shared fixtures for the integration tests: an in-memory database that
//! interprets the statements Keel renders, and a small entity model.
#![allow(dead_code)]

pub mod model;
mod sql;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::CancelKind;
use asupersync::runtime::RuntimeBuilder;
use keel::{
    Connection, ConnectionError, ConnectionErrorKind, Connector, Cx, DatabaseError, Dialect, Error,
    Outcome, Row, Value,
};

use sql::{Output, Record, Table};

struct Failure {
    prefix: String,
    code: String,
    remaining: usize,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Table>,
    failures: Vec<Failure>,
    log: Vec<String>,
}

/// A database shared by every connection of a [`MemoryConnector`].
///
/// Tables are schema-less: a row holds whatever columns were inserted.
/// Transactions snapshot all tables on `BEGIN` and restore them on
/// `ROLLBACK`, so concurrent writers are not isolated from each other.
#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<State>,
    alive: AtomicBool,
    connects: AtomicUsize,
    refuse_connections: AtomicBool,
    lost_commits: AtomicUsize,
    cancel_after: Mutex<Option<(String, Cx)>>,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        let db = Self::default();
        db.alive.store(true, Ordering::SeqCst);
        Arc::new(db)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a table whose `key` column is assigned on insert when absent.
    pub fn table(&self, name: &str, key: &str) -> &Self {
        self.lock()
            .tables
            .entry(name.to_string())
            .or_default()
            .key = Some(key.to_string());
        self
    }

    /// Reject inserts repeating a non-null value of `column`.
    pub fn unique(&self, table: &str, column: &str) -> &Self {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .unique
            .push(column.to_string());
        self
    }

    /// Fail the next `times` statements starting with `prefix` with a driver error `code`.
    pub fn fail_on(&self, prefix: &str, code: &str, times: usize) {
        self.lock().failures.push(Failure {
            prefix: prefix.to_string(),
            code: code.to_string(),
            remaining: times,
        });
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Simulate the server going away (or coming back).
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Apply the next `times` commits, then report the connection as lost.
    pub fn lose_after_commit(&self, times: usize) {
        self.lost_commits.store(times, Ordering::SeqCst);
    }

    /// Cancel `cx` once a statement starting with `prefix` has run.
    pub fn cancel_after(&self, prefix: &str, cx: &Cx) {
        *self
            .cancel_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((prefix.to_string(), cx.clone()));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Opens [`MemoryConnection`]s to one [`MemoryDb`].
pub struct MemoryConnector {
    db: Arc<MemoryDb>,
    dialect: Dialect,
}

impl MemoryConnector {
    pub fn postgres(db: &Arc<MemoryDb>) -> Self {
        Self {
            db: Arc::clone(db),
            dialect: Dialect::Postgres,
        }
    }

    pub fn mysql(db: &Arc<MemoryDb>) -> Self {
        Self {
            db: Arc::clone(db),
            dialect: Dialect::Mysql,
        }
    }
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MemoryConnection, Error>> + Send {
        let result = if self.db.refuse_connections.load(Ordering::SeqCst) {
            Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "connection refused".to_string(),
                transient: true,
                source: None,
            }))
        } else {
            self.db.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryConnection {
                db: Arc::clone(&self.db),
                dialect: self.dialect,
                snapshot: Mutex::new(None),
            })
        };
        async move { into_outcome(result) }
    }
}

pub struct MemoryConnection {
    db: Arc<MemoryDb>,
    dialect: Dialect,
    snapshot: Mutex<Option<BTreeMap<String, Table>>>,
}

impl MemoryConnection {
    fn run(&self, sql: &str, params: &[Value]) -> Result<Output, Error> {
        let output = self.apply(sql, params)?;
        let mut hook = self
            .db
            .cancel_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((_, cx)) = hook.take_if(|(prefix, _)| sql.starts_with(prefix.as_str())) {
            cx.cancel_with(CancelKind::User, Some("caller went away"));
        }
        Ok(output)
    }

    fn apply(&self, sql: &str, params: &[Value]) -> Result<Output, Error> {
        let mut state = self.db.lock();
        state.log.push(sql.to_string());

        if !self.db.alive.load(Ordering::SeqCst) {
            return Err(self.driver_error(self.lost_code(), "server closed the connection", sql));
        }
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.starts_with(f.prefix.as_str()))
        {
            failure.remaining -= 1;
            let code = failure.code.clone();
            return Err(self.driver_error(&code, "injected failure", sql));
        }

        let statement = sql::parse(sql, params)
            .map_err(|message| self.driver_error(self.syntax_code(), &message, sql))?;
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        match statement {
            sql::Statement::Begin => {
                *snapshot = Some(state.tables.clone());
                Ok(Output::Affected(0, None))
            }
            sql::Statement::Commit => {
                *snapshot = None;
                let lost = self
                    .db
                    .lost_commits
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if lost {
                    return Err(self.driver_error(self.lost_code(), "connection reset", sql));
                }
                Ok(Output::Affected(0, None))
            }
            sql::Statement::Rollback => {
                if let Some(tables) = snapshot.take() {
                    state.tables = tables;
                }
                Ok(Output::Affected(0, None))
            }
            other => sql::execute(&mut state.tables, other).map_err(|violation| {
                let code = match (violation, self.dialect) {
                    (sql::Violation::Unique(_), Dialect::Postgres) => "23505",
                    (sql::Violation::Unique(_), Dialect::Mysql) => "1062",
                    (sql::Violation::Invalid(_), Dialect::Postgres) => "42P01",
                    (sql::Violation::Invalid(_), Dialect::Mysql) => "1146",
                };
                self.driver_error(code, "statement rejected", sql)
            }),
        }
    }

    fn driver_error(&self, code: &str, message: &str, sql: &str) -> Error {
        Error::Database(DatabaseError {
            code: Some(code.to_string()),
            message: message.to_string(),
            sql: Some(sql.to_string()),
        })
    }

    fn lost_code(&self) -> &'static str {
        match self.dialect {
            Dialect::Postgres => "08006",
            Dialect::Mysql => "2013",
        }
    }

    fn syntax_code(&self) -> &'static str {
        match self.dialect {
            Dialect::Postgres => "42601",
            Dialect::Mysql => "1064",
        }
    }
}

impl Connection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run(sql, params).map(Output::into_rows);
        async move { into_outcome(result) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.run(sql, params).map(|out| out.affected());
        async move { into_outcome(result) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.run(sql, params).map(|out| out.last_insert_id());
        async move { into_outcome(result) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = if self.db.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "ping failed".to_string(),
                transient: true,
                source: None,
            }))
        };
        async move { into_outcome(result) }
    }
}

fn into_outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

/// Run `f` to completion on a fresh current-thread runtime.
pub fn block_on<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

#[track_caller]
pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(_) => panic!("unexpected cancellation"),
        Outcome::Panicked(_) => panic!("operation panicked"),
    }
}

#[track_caller]
pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(_) => panic!("unexpected cancellation"),
        Outcome::Panicked(_) => panic!("operation panicked"),
    }
}
