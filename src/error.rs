use diesel::result::DatabaseErrorKind;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Backend unavailable: {message}")]
    Connection { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Corrupt payload: {message}")]
    CorruptPayload { message: String },

    #[error("Storage adapter has not been initialized")]
    NotInitialized,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptPayload {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Only backend unavailability is worth retrying; everything else is
    /// either the caller's fault or a data-integrity problem.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Connection {
            message: format!("IO error: {}", err),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::CorruptPayload {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<diesel::result::Error> for PersistenceError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::Error as DieselError;

        match err {
            DieselError::NotFound => PersistenceError::NotFound {
                entity: "row",
                id: "unknown".to_string(),
            },
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                PersistenceError::Conflict {
                    message: info.message().to_string(),
                }
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                PersistenceError::NotFound {
                    entity: "dataset",
                    id: info.details().unwrap_or("referenced row").to_string(),
                }
            }
            DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, info)
            | DieselError::DatabaseError(DatabaseErrorKind::NotNullViolation, info) => {
                PersistenceError::Validation {
                    message: info.message().to_string(),
                }
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info)
            | DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                PersistenceError::Connection {
                    message: info.message().to_string(),
                }
            }
            DieselError::BrokenTransactionManager => PersistenceError::Connection {
                message: "Database transaction manager is broken".to_string(),
            },
            DieselError::DeserializationError(e) => PersistenceError::CorruptPayload {
                message: format!("Failed to decode database row: {}", e),
            },
            other => PersistenceError::Internal {
                message: format!("Database error: {}", other),
            },
        }
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for PersistenceError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        PersistenceError::Connection {
            message: format!("Failed to get database connection: {}", err),
        }
    }
}

impl From<object_store::Error> for PersistenceError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => PersistenceError::NotFound {
                entity: "object",
                id: path,
            },
            object_store::Error::AlreadyExists { path, .. } => PersistenceError::Conflict {
                message: format!("Object already exists: {}", path),
            },
            object_store::Error::Precondition { path, .. } => PersistenceError::Conflict {
                message: format!("Object changed concurrently: {}", path),
            },
            object_store::Error::InvalidPath { .. } => PersistenceError::Validation {
                message: err.to_string(),
            },
            other => PersistenceError::Connection {
                message: format!("Object store error: {}", other),
            },
        }
    }
}
