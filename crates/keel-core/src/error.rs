//! Error types for Keel operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all Keel operations.
#[derive(Debug)]
pub enum Error {
    /// Metadata lookup for a type that was never registered
    UnregisteredEntity(UnregisteredEntity),
    /// Startup-time metadata registration failures
    Registration(RegistrationError),
    /// Connection pool errors
    Pool(PoolError),
    /// Connection-level failures (connect, disconnect, authentication)
    Connection(ConnectionError),
    /// Row data does not fit the registered metadata
    Mapping(MappingError),
    /// Statement rejected by the database (constraints, deadlocks, ...)
    Persistence(PersistenceError),
    /// No row matched the requested key
    NotFound(NotFound),
    /// Invalid query request (unknown column, malformed finder, ...)
    Query(QueryError),
    /// Unclassified driver error, carrying the vendor code
    Database(DatabaseError),
    /// Value conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug, Clone)]
pub struct UnregisteredEntity {
    pub entity: String,
}

#[derive(Debug, Clone)]
pub struct RegistrationError {
    pub entity: String,
    pub kind: RegistrationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationErrorKind {
    /// Type registered twice through the strict API
    DuplicateRegistration,
    /// Field kind cannot be converted to or from the declared SQL type
    UnsupportedColumnType,
    /// No primary key column declared
    MissingPrimaryKey,
    /// More than one primary key column declared
    MultiplePrimaryKeys,
    /// Two columns share a name
    DuplicateColumn,
    /// Table or column name is not a valid identifier
    InvalidIdentifier,
    /// Relationship points at a type that is not registered
    UnknownRelationshipTarget,
    /// Relationship join specification does not fit its kind
    InvalidRelationship,
}

#[derive(Debug, Clone)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No connection became available within the wait bound
    Exhausted,
    /// Pool has been closed
    Closed,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    /// Whether retrying on a fresh connection may succeed
    pub transient: bool,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Unknown database or other configuration problem
    Configuration,
    /// Liveness check failed
    Validation,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub entity: String,
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    /// SQLSTATE or vendor error number reported by the driver
    pub code: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Deadlock,
    SerializationFailure,
    /// Operation needs a primary key value the entity does not carry
    MissingKey,
    Other,
}

#[derive(Debug, Clone)]
pub struct NotFound {
    pub entity: String,
    pub key: Value,
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Filter or ordering names a column the entity does not map
    UnknownColumn,
    /// Include or fetch names a relationship the entity does not declare
    UnknownRelationship,
    /// Comparator and value do not fit together
    InvalidFilter,
    /// Derived finder name could not be parsed
    InvalidFinder,
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    /// SQLSTATE (PostgreSQL) or error number (MySQL)
    pub code: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Statement issued outside an open transaction
    NotActive,
    /// Transaction was already committed or rolled back
    AlreadyFinished,
    /// The connection failed while COMMIT was in flight; the server may or
    /// may not have applied the transaction
    CommitOutcomeUnknown,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Is this a transient error that may succeed when the unit of work is retried?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pool(e) => e.kind == PoolErrorKind::Exhausted,
            Error::Connection(e) => e.transient,
            Error::Persistence(e) => matches!(
                e.kind,
                PersistenceErrorKind::Deadlock | PersistenceErrorKind::SerializationFailure
            ),
            _ => false,
        }
    }

    /// Does this error report a conflict with existing data?
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Persistence(PersistenceError {
                kind: PersistenceErrorKind::UniqueViolation
                    | PersistenceErrorKind::ForeignKeyViolation,
                ..
            })
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Is this a connection-level error?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Get the SQL statement that triggered this error, if known.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Persistence(e) => e.sql.as_deref(),
            Error::Database(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    pub fn unregistered(entity: impl Into<String>) -> Self {
        Error::UnregisteredEntity(UnregisteredEntity {
            entity: entity.into(),
        })
    }

    pub fn mapping(entity: impl Into<String>, column: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.into(),
            column: column.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn not_found(entity: impl Into<String>, key: Value) -> Self {
        Error::NotFound(NotFound {
            entity: entity.into(),
            key,
        })
    }

    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            message: message.into(),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }
}

impl RegistrationError {
    pub fn new(entity: &str, kind: RegistrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            entity: entity.to_string(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnregisteredEntity(e) => {
                write!(f, "Entity not registered: {}", e.entity)
            }
            Error::Registration(e) => write!(f, "Registration error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e),
            Error::NotFound(e) => write!(f, "{} not found for key {}", e.entity, e.key),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.entity, self.kind, self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transient = if self.transient { "transient" } else { "permanent" };
        write!(f, "{:?} ({}): {}", self.kind, transient, self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(col) => write!(f, "{}.{}: {}", self.entity, col, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{:?} [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<RegistrationError> for Error {
    fn from(err: RegistrationError) -> Self {
        Error::Registration(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        Error::Database(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;
