//! Taxonomía de errores de negocio del motor.
//!
//! Las variantes clasifican por tratamiento, no por origen:
//! - `Validation` / `Rule`: el registro candidato viola una restricción.
//! - `Permission` / `Unauthorized`: denegaciones de acceso.
//! - `NotFound`: id referenciado inexistente.
//! - `Conflict`: violación de unicidad o duplicado lógico; reintentar no ayuda.
//! - `Transient`: deadlock o fallo de serialización; reintentable dentro de la
//!   transacción con política acotada.
//! - `Fatal`: inconsistencia que debe abortar la transacción (auditoría,
//!   enqueue de outbox, metadatos tras DDL).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    #[error("validation failed on '{field}': {message}")]
    Validation { field: String, message: String },
    #[error("{message}")]
    Rule { message: String },
    #[error("permission denied: {operation} on {target}")]
    Permission { operation: String, target: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("formula error: {0}")]
    Formula(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(),
                           message: message.into() }
    }

    pub fn permission(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Permission { operation: operation.into(),
                           target: target.into() }
    }

    pub fn not_found(entity: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound { entity: entity.into(),
                         id: id.to_string() }
    }

    /// Sólo los errores `Transient` habilitan la política de reintento (3
    /// intentos con transacción fresca).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
