//! Definición de campos: tipos, lookups (simples y polimórficos),
//! Master-Detail, fórmulas, rollups y numeración automática.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Number,
    Currency,
    Percent,
    Boolean,
    Date,
    DateTime,
    Picklist,
    Lookup,
    Formula,
    RollupSummary,
    AutoNumber,
    Json,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "currency" => Some(Self::Currency),
            "percent" => Some(Self::Percent),
            "boolean" | "checkbox" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "datetime" => Some(Self::DateTime),
            "picklist" => Some(Self::Picklist),
            "lookup" => Some(Self::Lookup),
            "formula" => Some(Self::Formula),
            "rollupsummary" | "rollup_summary" => Some(Self::RollupSummary),
            "autonumber" | "auto_number" => Some(Self::AutoNumber),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Number => "Number",
            Self::Currency => "Currency",
            Self::Percent => "Percent",
            Self::Boolean => "Boolean",
            Self::Date => "Date",
            Self::DateTime => "DateTime",
            Self::Picklist => "Picklist",
            Self::Lookup => "Lookup",
            Self::Formula => "Formula",
            Self::RollupSummary => "RollupSummary",
            Self::AutoNumber => "AutoNumber",
            Self::Json => "Json",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Currency | Self::Percent)
    }

    /// Los campos virtuales se materializan en la base (columna generada o
    /// recomputada por el motor) y nunca se escriben desde un registro.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Formula | Self::RollupSummary)
    }
}

/// Regla de borrado aplicada a los hijos de un lookup cuando el padre se
/// elimina.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteRule {
    Cascade,
    SetNull,
    Restrict,
}

impl DeleteRule {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cascade" => Some(Self::Cascade),
            "setnull" | "set_null" => Some(Self::SetNull),
            "restrict" => Some(Self::Restrict),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cascade => "Cascade",
            Self::SetNull => "SetNull",
            Self::Restrict => "Restrict",
        }
    }
}

/// Agregado soportado por un campo RollupSummary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl RollupFunction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// Valor por defecto ante conjunto vacío: COUNT/SUM/AVG = 0, MIN/MAX =
    /// null.
    pub fn zero_default(&self) -> bool {
        matches!(self, Self::Count | Self::Sum | Self::Avg)
    }
}

/// Configuración de un rollup: objeto hijo, campo de relación hacia el padre,
/// campo sumarizado y filtro opcional (texto validado contra denylist antes de
/// interpolarse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupConfig {
    pub summary_object: String,
    pub relationship_field: String,
    pub summary_field: Option<String>,
    pub function: RollupFunction,
    pub filter: Option<String>,
}

/// Numeración automática por (objeto, campo). `display_format` admite un
/// bloque `{0000}` cuya longitud define el padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoNumberDef {
    pub object_api_name: String,
    pub field_api_name: String,
    pub display_format: String,
    pub current_number: i64,
}

impl AutoNumberDef {
    /// Formatea un número según `display_format`, p.ej. `INV-{0000}` con 7 →
    /// `INV-0007`. Sin bloque de padding, el número se anexa tal cual.
    pub fn format(&self, n: i64) -> String {
        if let (Some(start), Some(end)) = (self.display_format.find('{'), self.display_format.find('}')) {
            if start < end {
                let width = end - start - 1;
                let mut out = String::new();
                out.push_str(&self.display_format[..start]);
                out.push_str(&format!("{:0width$}", n, width = width));
                out.push_str(&self.display_format[end + 1..]);
                return out;
            }
        }
        format!("{}{}", self.display_format, n)
    }
}

/// Campo de un objeto. Pertenece a exactamente un `ObjectDef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub api_name: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
    pub default_value: Option<Value>,
    pub help_text: Option<String>,
    pub is_system: bool,
    pub is_name_field: bool,
    pub options: Vec<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub regex: Option<String>,
    pub regex_message: Option<String>,
    pub reference_to: Vec<String>,
    pub is_master_detail: bool,
    pub delete_rule: Option<DeleteRule>,
    pub relationship_name: Option<String>,
    pub formula: Option<String>,
    pub return_type: Option<FieldType>,
    pub rollup_config: Option<RollupConfig>,
    pub validator: Option<String>,
    pub validator_config: Option<Value>,
}

impl FieldDef {
    /// Constructor con los defaults de un campo simple; el resto se ajusta por
    /// mutación antes de registrar.
    pub fn new(api_name: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self { api_name: api_name.into(),
               label: label.into(),
               field_type,
               required: false,
               unique: false,
               default_value: None,
               help_text: None,
               is_system: false,
               is_name_field: false,
               options: Vec::new(),
               min_length: None,
               max_length: None,
               min_value: None,
               max_value: None,
               regex: None,
               regex_message: None,
               reference_to: Vec::new(),
               is_master_detail: false,
               delete_rule: None,
               relationship_name: None,
               formula: None,
               return_type: None,
               rollup_config: None,
               validator: None,
               validator_config: None }
    }

    /// Derivado: un lookup con más de un objeto destino es polimórfico.
    pub fn is_polymorphic(&self) -> bool {
        self.field_type == FieldType::Lookup && self.reference_to.len() > 1
    }

    /// Columna discriminadora auxiliar de un lookup polimórfico.
    pub fn type_column_name(&self) -> String {
        format!("{}_type", self.api_name)
    }

    pub fn is_virtual(&self) -> bool {
        self.field_type.is_virtual()
    }

    /// Invariantes estructurales del campo, verificadas al registrarlo:
    /// - Lookup requiere al menos un destino.
    /// - Master-Detail implica Lookup + required + Cascade.
    /// - Formula requiere `formula` y `return_type`.
    /// - RollupSummary requiere `rollup_config`.
    pub fn validate_definition(&self) -> Result<(), EngineError> {
        match self.field_type {
            FieldType::Lookup => {
                if self.reference_to.is_empty() {
                    return Err(EngineError::validation(&self.api_name, "lookup requires at least one reference_to"));
                }
                if self.is_master_detail {
                    if !self.required {
                        return Err(EngineError::validation(&self.api_name, "master-detail field must be required"));
                    }
                    if self.delete_rule != Some(DeleteRule::Cascade) {
                        return Err(EngineError::validation(&self.api_name,
                                                           "master-detail field must cascade on delete"));
                    }
                }
            }
            FieldType::Formula => {
                if self.formula.as_deref().map(str::trim).unwrap_or("").is_empty() || self.return_type.is_none() {
                    return Err(EngineError::validation(&self.api_name,
                                                       "formula field requires formula and return_type"));
                }
            }
            FieldType::RollupSummary => {
                if self.rollup_config.is_none() {
                    return Err(EngineError::validation(&self.api_name, "rollup field requires rollup_config"));
                }
            }
            _ => {
                if self.is_master_detail {
                    return Err(EngineError::validation(&self.api_name, "master-detail requires a lookup field"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_number_formatting() {
        let def = AutoNumberDef { object_api_name: "invoice".into(),
                                  field_api_name: "number".into(),
                                  display_format: "INV-{0000}".into(),
                                  current_number: 0 };
        assert_eq!(def.format(7), "INV-0007");
        assert_eq!(def.format(12345), "INV-12345");
    }

    #[test]
    fn master_detail_invariants() {
        let mut f = FieldDef::new("invoice_id", "Invoice", FieldType::Lookup);
        f.reference_to = vec!["invoice".into()];
        f.is_master_detail = true;
        f.required = true;
        assert!(f.validate_definition().is_err(), "cascade rule missing");
        f.delete_rule = Some(DeleteRule::Cascade);
        assert!(f.validate_definition().is_ok());
        f.required = false;
        assert!(f.validate_definition().is_err());
    }

    #[test]
    fn polymorphic_is_derived() {
        let mut f = FieldDef::new("related_to", "Related To", FieldType::Lookup);
        f.reference_to = vec!["ticket".into()];
        assert!(!f.is_polymorphic());
        f.reference_to.push("account".into());
        assert!(f.is_polymorphic());
        assert_eq!(f.type_column_name(), "related_to_type");
    }
}
