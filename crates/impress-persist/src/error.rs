//! Error types for impress-persist

use thiserror::Error;

use crate::value::{describe_value, SqlValue};

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Main error type for persistence operations
#[derive(Error, Debug)]
pub enum DbError {
    /// No explicit or self-describing converter exists for a value type
    #[error("Unsupported column type: {type_name}")]
    UnsupportedColumnType { type_name: &'static str },

    /// A converter could not encode or decode a value
    #[error("Conversion error for {type_name}: {message}")]
    Conversion {
        type_name: &'static str,
        message: String,
    },

    /// Table or column definition is invalid, or DDL failed
    #[error("Schema error on table '{table}': {message}")]
    Schema { table: String, message: String },

    /// The upgrade callback failed; the stored version is unchanged
    #[error("Upgrade from version {from} to {to} failed: {source}")]
    Upgrade {
        from: u32,
        to: u32,
        #[source]
        source: Box<DbError>,
    },

    /// SQL execution failed
    #[error("Statement failed: {source} (sql: {sql}, args: [{}])", join_args(.args))]
    Statement {
        sql: String,
        args: Vec<SqlValue>,
        #[source]
        source: rusqlite::Error,
    },

    /// Beginning or committing a transaction failed
    #[error("Transaction error: {message}: {source}")]
    Transaction {
        message: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Malformed query construction
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The operation needs an assigned id
    #[error("Entity for table '{table}' has no bound id")]
    UnboundId { table: String },

    /// A column name does not belong to the entity
    #[error("Unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The manager was closed
    #[error("Database '{0}' is closed")]
    Closed(String),

    /// A caller-supplied callback failed
    #[error("Callback error: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Connection-level database error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Wrap an arbitrary error raised inside a callback.
    pub fn callback(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        DbError::Callback(err.into())
    }

    pub(crate) fn statement(sql: &str, args: &[SqlValue], source: rusqlite::Error) -> Self {
        DbError::Statement {
            sql: sql.to_string(),
            args: args.to_vec(),
            source,
        }
    }

    pub(crate) fn conversion(type_name: &'static str, message: impl Into<String>) -> Self {
        DbError::Conversion {
            type_name,
            message: message.into(),
        }
    }

    pub(crate) fn schema(table: &str, message: impl Into<String>) -> Self {
        DbError::Schema {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// True when the underlying engine reported a constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        let source = match self {
            DbError::Statement { source, .. } | DbError::Sqlite(source) => source,
            _ => return false,
        };
        matches!(
            source,
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

fn join_args(args: &[SqlValue]) -> String {
    args.iter().map(describe_value).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_error_names_sql_and_args() {
        let err = DbError::statement(
            "INSERT INTO t (a) VALUES (?)",
            &[SqlValue::Text("x".into())],
            rusqlite::Error::InvalidQuery,
        );
        let msg = err.to_string();
        assert!(msg.contains("INSERT INTO t (a) VALUES (?)"));
        assert!(msg.contains("'x'"));
    }

    #[test]
    fn unsupported_type_names_the_type() {
        let err = DbError::UnsupportedColumnType {
            type_name: "my::Custom",
        };
        assert!(err.to_string().contains("my::Custom"));
    }

    #[test]
    fn callback_errors_wrap_strings() {
        let err = DbError::callback("listener exploded");
        assert!(err.to_string().contains("listener exploded"));
        assert!(!err.is_constraint_violation());
    }
}
