//! Per-dialect rendering and error classification.
//!
//! Everything that differs between MySQL and PostgreSQL lives here: identifier
//! quoting, placeholder syntax, how a generated key is read back after an
//! insert, and how vendor error codes map onto the error taxonomy.

use std::fmt;

use crate::error::{
    ConnectionError, ConnectionErrorKind, DatabaseError, Error, PersistenceError,
    PersistenceErrorKind,
};
use crate::identifiers::{quote_ident, quote_ident_mysql};

/// SQL dialect, selected once when the database is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL (`"ident"`, `$1` placeholders, `RETURNING`)
    #[default]
    Postgres,
    /// MySQL (`` `ident` ``, `?` placeholders, `LAST_INSERT_ID()`)
    Mysql,
}

/// How the key assigned by the database is obtained after an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRetrieval {
    /// `INSERT ... RETURNING key`, read from the first result row.
    Returning,
    /// The driver's last-insert-id after executing the insert.
    LastInsertId,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres => quote_ident(name),
            Dialect::Mysql => quote_ident_mysql(name),
        }
    }

    pub const fn key_retrieval(self) -> KeyRetrieval {
        match self {
            Dialect::Postgres => KeyRetrieval::Returning,
            Dialect::Mysql => KeyRetrieval::LastInsertId,
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::Mysql => 3306,
        }
    }

    /// Statement used to check that a connection is alive.
    pub const fn ping_sql(self) -> &'static str {
        "SELECT 1"
    }

    pub const fn begin_sql(self) -> &'static str {
        match self {
            Dialect::Postgres => "BEGIN",
            Dialect::Mysql => "START TRANSACTION",
        }
    }

    pub const fn commit_sql(self) -> &'static str {
        "COMMIT"
    }

    pub const fn rollback_sql(self) -> &'static str {
        "ROLLBACK"
    }

    /// Parse a dialect name as used in configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Dialect::Postgres),
            "mysql" | "mariadb" => Some(Dialect::Mysql),
            _ => None,
        }
    }

    /// Map a raw driver error onto the error taxonomy.
    ///
    /// Errors other than [`Error::Database`] are returned unchanged.
    pub fn classify(self, err: Error) -> Error {
        let Error::Database(db) = err else {
            return err;
        };
        let code = db.code.as_deref().unwrap_or_default();
        let class = match self {
            Dialect::Postgres => classify_sqlstate(code),
            Dialect::Mysql => classify_mysql(code),
        };
        match class {
            Class::Persistence(kind) => Error::Persistence(PersistenceError {
                kind,
                code: db.code,
                message: db.message,
                sql: db.sql,
            }),
            Class::Connection(kind, transient) => Error::Connection(ConnectionError {
                kind,
                message: db.message,
                transient,
                source: None,
            }),
            Class::Unknown => Error::Persistence(PersistenceError {
                kind: PersistenceErrorKind::Other,
                code: db.code,
                message: db.message,
                sql: db.sql,
            }),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Mysql => write!(f, "mysql"),
        }
    }
}

enum Class {
    Persistence(PersistenceErrorKind),
    Connection(ConnectionErrorKind, bool),
    Unknown,
}

fn classify_sqlstate(code: &str) -> Class {
    use PersistenceErrorKind as P;
    match code {
        "23505" => Class::Persistence(P::UniqueViolation),
        "23503" => Class::Persistence(P::ForeignKeyViolation),
        "23502" => Class::Persistence(P::NotNullViolation),
        "23514" => Class::Persistence(P::CheckViolation),
        "40P01" => Class::Persistence(P::Deadlock),
        "40001" => Class::Persistence(P::SerializationFailure),
        "3D000" => Class::Connection(ConnectionErrorKind::Configuration, false),
        c if c.starts_with("28") => Class::Connection(ConnectionErrorKind::Authentication, false),
        c if c.starts_with("08") => Class::Connection(ConnectionErrorKind::Disconnected, true),
        c if c.starts_with("57P0") => Class::Connection(ConnectionErrorKind::Disconnected, true),
        _ => Class::Unknown,
    }
}

fn classify_mysql(code: &str) -> Class {
    use PersistenceErrorKind as P;
    match code {
        "1062" => Class::Persistence(P::UniqueViolation),
        "1451" | "1452" => Class::Persistence(P::ForeignKeyViolation),
        "1048" => Class::Persistence(P::NotNullViolation),
        "3819" => Class::Persistence(P::CheckViolation),
        "1213" => Class::Persistence(P::Deadlock),
        "1205" => Class::Persistence(P::SerializationFailure),
        "1045" => Class::Connection(ConnectionErrorKind::Authentication, false),
        "1049" => Class::Connection(ConnectionErrorKind::Configuration, false),
        "2002" | "2003" => Class::Connection(ConnectionErrorKind::Connect, true),
        "2006" | "2013" => Class::Connection(ConnectionErrorKind::Disconnected, true),
        _ => Class::Unknown,
    }
}

impl DatabaseError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            sql: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}
