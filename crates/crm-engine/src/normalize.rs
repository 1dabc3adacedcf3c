//! Normalización de registros entrantes contra el esquema: matching
//! case-insensitive de claves y coerción de tipos.
//!
//! Reglas:
//! - Las claves se canonicalizan a la grafía del api_name del campo.
//! - Claves desconocidas, campos virtuales y campos de sistema del payload se
//!   descartan (los de sistema los estampa el motor, nunca el cliente).
//! - Coerción: "true"/"false"/0/1 → Bool, string numérico → número, string
//!   RFC3339 → Timestamp para campos DateTime.

use chrono::DateTime;
use log::debug;

use crm_domain::{system_fields, EngineError, FieldDef, FieldType, FieldValue, ObjectDef, SObject};

fn coerce(field: &FieldDef, value: FieldValue) -> Result<FieldValue, EngineError> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let bad = |msg: &str| EngineError::validation(&field.api_name, msg);
    match field.field_type {
        FieldType::Boolean => match value {
            FieldValue::Bool(_) => Ok(value),
            FieldValue::Int(0) => Ok(FieldValue::Bool(false)),
            FieldValue::Int(1) => Ok(FieldValue::Bool(true)),
            FieldValue::Text(s) if s.eq_ignore_ascii_case("true") => Ok(FieldValue::Bool(true)),
            FieldValue::Text(s) if s.eq_ignore_ascii_case("false") => Ok(FieldValue::Bool(false)),
            _ => Err(bad("expected a boolean")),
        },
        FieldType::Number | FieldType::Currency | FieldType::Percent => match value {
            FieldValue::Int(_) | FieldValue::Float(_) => Ok(value),
            FieldValue::Text(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(FieldValue::Int(i))
                } else {
                    trimmed.parse::<f64>().map(FieldValue::Float).map_err(|_| bad("expected a number"))
                }
            }
            _ => Err(bad("expected a number")),
        },
        FieldType::DateTime | FieldType::Date => match value {
            FieldValue::Timestamp(_) => Ok(value),
            FieldValue::Text(s) => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
                    Ok(FieldValue::Timestamp(ts.with_timezone(&chrono::Utc)))
                } else {
                    // Las fechas planas (YYYY-MM-DD) viajan como texto y las
                    // castea el storage.
                    Ok(FieldValue::Text(s))
                }
            }
            _ => Err(bad("expected a date")),
        },
        FieldType::Lookup => match value {
            FieldValue::Text(_) => Ok(value),
            _ => Err(bad("expected a record id")),
        },
        _ => Ok(value),
    }
}

/// Normaliza el payload entrante contra el esquema. Devuelve un registro con
/// claves canónicas y valores coercionados; nunca contiene campos de sistema
/// ni virtuales.
pub fn normalize_input(object: &ObjectDef, input: &SObject) -> Result<SObject, EngineError> {
    let mut out = SObject::new();
    for (key, value) in input.iter() {
        if system_fields::is_system(key) {
            continue;
        }
        let Some(field) = object.field(key) else {
            debug!("normalize: dropping unknown field '{}' on {}", key, object.api_name);
            continue;
        };
        if field.is_virtual() || field.field_type == FieldType::AutoNumber {
            continue;
        }
        out.set(field.api_name.clone(), coerce(field, value.clone())?);
    }
    Ok(out)
}

/// Aplica defaults declarados del esquema a los campos ausentes (sólo
/// inserts).
pub fn apply_defaults(object: &ObjectDef, record: &mut SObject) {
    for field in object.fields.values() {
        if field.is_system || field.is_virtual() || field.field_type == FieldType::AutoNumber {
            continue;
        }
        if record.contains_key(&field.api_name) {
            continue;
        }
        if let Some(default) = field.default_value.as_ref() {
            record.set(field.api_name.clone(), FieldValue::from_json(default));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::SharingModel;

    fn schema() -> ObjectDef {
        let mut obj = ObjectDef { api_name: "ticket".into(),
                                  label: "Ticket".into(),
                                  plural_label: "Tickets".into(),
                                  description: None,
                                  is_custom: true,
                                  sharing_model: SharingModel::Private,
                                  app_id: None,
                                  table_type: None,
                                  list_fields: vec![],
                                  icon: None,
                                  fields: Default::default() };
        obj.add_field(FieldDef::new("Name", "Name", FieldType::Text));
        obj.add_field(FieldDef::new("amount", "Amount", FieldType::Number));
        obj.add_field(FieldDef::new("is_open", "Open", FieldType::Boolean));
        let mut status = FieldDef::new("status", "Status", FieldType::Picklist);
        status.default_value = Some(serde_json::json!("New"));
        obj.add_field(status);
        obj
    }

    #[test]
    fn keys_match_case_insensitively_and_coerce() {
        let obj = schema();
        let mut input = SObject::new();
        input.set("NAME", "Crash");
        input.set("Amount", "150");
        input.set("IS_OPEN", "true");
        input.set("unknown_field", "x");
        input.set("owner_id", "not allowed from client");

        let out = normalize_input(&obj, &input).unwrap();
        assert_eq!(out.get_str("Name"), Some("Crash"));
        assert_eq!(out.get("amount"), Some(&FieldValue::Int(150)));
        assert_eq!(out.get("is_open"), Some(&FieldValue::Bool(true)));
        assert!(!out.contains_key("unknown_field"));
        assert!(!out.contains_key("owner_id"));
        // La clave canónica preserva la grafía del esquema.
        assert!(out.keys().any(|k| k == "Name"));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let obj = schema();
        let mut rec = SObject::new();
        rec.set("Name", "x");
        apply_defaults(&obj, &mut rec);
        assert_eq!(rec.get_str("status"), Some("New"));
    }

    #[test]
    fn bad_coercion_is_a_validation_error() {
        let obj = schema();
        let mut input = SObject::new();
        input.set("amount", "not a number");
        assert!(matches!(normalize_input(&obj, &input),
                         Err(EngineError::Validation { field, .. }) if field == "amount"));
    }
}
