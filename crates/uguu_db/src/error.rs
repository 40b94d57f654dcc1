//! Error types for the catalog database layer.

use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, constraint reported by SQLite, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Catalog invariant broken by the data we were asked to write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Stored value that does not map to a known domain value
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a constraint error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True for unique, foreign key, not-null and check violations, whether
    /// SQLite reported them or the catalog code detected them itself.
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Self::Constraint(_) => true,
            Self::Sqlx(sqlx::Error::Database(db_err)) => !matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::Other
            ),
            _ => false,
        }
    }

    /// True when the error is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(sqlx::Error::Database(db_err))
                if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
        )
    }

    /// True when the error is a foreign key violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(sqlx::Error::Database(db_err))
                if matches!(db_err.kind(), sqlx::error::ErrorKind::ForeignKeyViolation)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_is_integrity_violation() {
        assert!(DbError::constraint("slot 7 outside 0..3").is_integrity_violation());
        assert!(!DbError::not_found("share 1").is_integrity_violation());
        assert!(!DbError::invalid_state("bogus").is_integrity_violation());
    }
}
