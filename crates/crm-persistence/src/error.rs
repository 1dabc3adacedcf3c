//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y los traduce a
//! la taxonomía de negocio (`EngineError`).

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use crm_domain::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                other => {
                    // Deadlocks llegan como Unknown según la versión del driver.
                    let msg = info.message();
                    if msg.to_lowercase().contains("deadlock detected") {
                        Self::SerializationConflict
                    } else {
                        Self::Unknown(format!("db error kind {:?}: {}", other, msg))
                    }
                }
            },
            DieselError::DeserializationError(e) => Self::Unknown(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl PersistenceError {
    /// Errores que habilitan reintento con transacción fresca.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SerializationConflict | Self::TransientIo(_) => true,
            Self::Unknown(msg) => {
                let m = msg.to_lowercase();
                m.contains("deadlock detected")
                || m.contains("could not serialize access due to concurrent update")
                || m.contains("connection closed")
                || m.contains("connection refused")
                || m.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<PersistenceError> for EngineError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::UniqueViolation(m) => EngineError::Conflict(m),
            PersistenceError::CheckViolation(m) => EngineError::Validation { field: String::new(),
                                                                             message: m },
            PersistenceError::ForeignKeyViolation(m) => EngineError::Conflict(m),
            PersistenceError::NotFound => EngineError::not_found("row", "unknown"),
            PersistenceError::SerializationConflict => EngineError::Transient("serialization conflict".into()),
            PersistenceError::TransientIo(m) => EngineError::Transient(m),
            PersistenceError::Unknown(m) => {
                if m.to_lowercase().contains("deadlock detected") {
                    EngineError::Transient(m)
                } else {
                    EngineError::Internal(m)
                }
            }
        }
    }
}
