//! Reglas de validación declarativas por objeto.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Regla activa: si su condición evalúa verdadera sobre el registro candidato,
/// la operación falla con `error_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRuleDef {
    pub id: Uuid,
    pub object_api_name: String,
    pub name: String,
    pub condition: String,
    pub error_message: String,
    pub active: bool,
}
