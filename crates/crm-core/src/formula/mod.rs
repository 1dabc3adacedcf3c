//! Evaluador de fórmulas sobre registros dinámicos.
//!
//! Rol en el motor:
//! - Condiciones de disparo de flujos y criterios de reglas de compartición.
//! - Reglas de validación declarativas (condición verdadera ⇒ error).
//! - Mapeos de campos con prefijo `=` y valores de acción `{! ... }`.
//! - Reescritura a SQL de storage para columnas generadas (campos Formula).
//!
//! El contexto resuelve identificadores contra el registro candidato (case-
//! insensitive), el registro previo (`old.campo`) y la sesión (`user.id`).
//! La visibilidad a nivel de campo se aplica vía callback `is_visible`: un
//! campo no visible evalúa a null.

mod eval;
mod lexer;
mod parser;

pub use eval::FormulaContext;

use crm_domain::{EngineError, FieldValue};

use crate::actions::CredentialHasher;

/// Fachada sin estado del evaluador.
pub struct FormulaEngine;

impl FormulaEngine {
    /// Evalúa una expresión y devuelve el valor resultante.
    pub fn evaluate(expr: &str, ctx: &FormulaContext<'_>) -> Result<FieldValue, EngineError> {
        let tokens = lexer::tokenize(expr)?;
        let ast = parser::parse(&tokens)?;
        eval::eval(&ast, ctx)
    }

    /// Evalúa una expresión como condición booleana (truthiness del valor).
    pub fn evaluate_condition(expr: &str, ctx: &FormulaContext<'_>) -> Result<bool, EngineError> {
        Ok(Self::evaluate(expr, ctx)?.is_truthy())
    }

    /// Reescribe la fórmula al dialecto del storage para emitirla como columna
    /// generada (`GENERATED ALWAYS AS (expr) STORED`). Sólo se admite el
    /// subconjunto de tokens representable en SQL; funciones dependientes de
    /// contexto (BCRYPT) se rechazan.
    pub fn to_storage_sql(expr: &str) -> Result<String, EngineError> {
        let tokens = lexer::tokenize(expr)?;
        // Valida la estructura antes de reescribir.
        parser::parse(&tokens)?;
        eval::rewrite_storage_sql(&tokens)
    }
}

/// Detecta el modo de un valor crudo de configuración de flujo/acción:
/// `=expr` (mapeos de campos) y `{! expr }` (configs de acción) se evalúan,
/// el resto es literal.
pub fn formula_body(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("{!") {
        return rest.strip_suffix('}').map(str::trim);
    }
    trimmed.strip_prefix('=').map(str::trim)
}

/// Evalúa un valor crudo respetando el modo formula/literal.
pub fn resolve_raw(raw: &str, ctx: &FormulaContext<'_>) -> Result<FieldValue, EngineError> {
    match formula_body(raw) {
        Some(body) => FormulaEngine::evaluate(body, ctx),
        None => Ok(FieldValue::Text(raw.to_string())),
    }
}

/// Hook de hashing usado por la función BCRYPT; se reexporta para que los
/// constructores del contexto no dependan del módulo de acciones.
pub type HasherRef<'a> = &'a dyn CredentialHasher;
