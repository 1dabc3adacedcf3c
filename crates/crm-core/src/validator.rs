//! Validación de registros contra el esquema y las reglas declarativas.
//!
//! Orden de evaluación:
//! 1. Required en campos no-sistema (los AutoNumber y virtuales se estampan
//!    del lado del servidor y quedan exentos).
//! 2. Compatibilidad de coerción por tipo (booleans aceptan true/false en
//!    string y 0/1; numéricos aceptan string numérico; strings respetan
//!    min/max length y regex con `regex_message`; números respetan
//!    min/max value; picklist valida pertenencia a options).
//! 3. Validadores nominados del registro de tipos (email, url, phone).
//! 4. Validador pluggable declarado por el campo, con config JSON opcional.
//! 5. Reglas custom activas: condición verdadera ⇒ error con el mensaje de la
//!    regla.

use std::collections::HashMap;
use std::sync::Arc;

use crm_domain::{EngineError, FieldDef, FieldType, FlowDef, ObjectDef, SObject, UserContext, ValidationRuleDef};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::formula::{FormulaContext, FormulaEngine};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email regex"));
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://[^\s]+$").expect("url regex"));
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9 ().-]{5,20}$").expect("phone regex"));

/// Validador pluggable por nombre. `config` llega tal cual del metadato del
/// campo.
pub trait FieldValidator: Send + Sync {
    fn validate(&self, field: &FieldDef, value: &crm_domain::FieldValue, config: Option<&Value>)
                -> Result<(), String>;
}

struct RegexValidator {
    pattern: &'static Regex,
    message: &'static str,
}

impl FieldValidator for RegexValidator {
    fn validate(&self, _field: &FieldDef, value: &crm_domain::FieldValue, _config: Option<&Value>)
                -> Result<(), String> {
        if value.is_blank() {
            return Ok(());
        }
        let s = value.to_display_string();
        if self.pattern.is_match(&s) {
            Ok(())
        } else {
            Err(self.message.to_string())
        }
    }
}

/// Validador de longitud configurable por JSON (`{"min": n, "max": m}`).
struct LengthValidator;

impl FieldValidator for LengthValidator {
    fn validate(&self, _field: &FieldDef, value: &crm_domain::FieldValue, config: Option<&Value>)
                -> Result<(), String> {
        let len = value.to_display_string().chars().count() as u64;
        let Some(cfg) = config else { return Ok(()) };
        if let Some(min) = cfg.get("min").and_then(Value::as_u64) {
            if len < min {
                return Err(format!("must be at least {min} characters"));
            }
        }
        if let Some(max) = cfg.get("max").and_then(Value::as_u64) {
            if len > max {
                return Err(format!("must be at most {max} characters"));
            }
        }
        Ok(())
    }
}

pub struct Validator {
    validators: HashMap<String, Arc<dyn FieldValidator>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        let mut validators: HashMap<String, Arc<dyn FieldValidator>> = HashMap::new();
        validators.insert("email".into(),
                          Arc::new(RegexValidator { pattern: &EMAIL_RE,
                                                    message: "must be a valid email address" }));
        validators.insert("url".into(),
                          Arc::new(RegexValidator { pattern: &URL_RE,
                                                    message: "must be a valid http(s) URL" }));
        validators.insert("phone".into(),
                          Arc::new(RegexValidator { pattern: &PHONE_RE,
                                                    message: "must be a valid phone number" }));
        validators.insert("length".into(), Arc::new(LengthValidator));
        Self { validators }
    }

    /// Registra o reemplaza un validador nominado.
    pub fn register(&mut self, name: impl Into<String>, validator: Arc<dyn FieldValidator>) {
        self.validators.insert(name.into().to_ascii_lowercase(), validator);
    }

    /// Valida el registro candidato. `old` presente indica update: los campos
    /// required ausentes del payload se toleran (ya tienen valor almacenado).
    pub fn validate_record(&self, record: &SObject, schema: &ObjectDef, rules: &[ValidationRuleDef],
                           old: Option<&SObject>, user: Option<&UserContext>)
                           -> Result<(), EngineError> {
        for field in schema.fields.values() {
            if field.is_system || field.is_virtual() || field.field_type == FieldType::AutoNumber {
                continue;
            }
            let value = record.get(&field.api_name);
            if field.required {
                let blank_incoming = value.map(|v| v.is_blank()).unwrap_or(false);
                let missing_on_insert = old.is_none() && value.is_none() && field.default_value.is_none();
                if blank_incoming || missing_on_insert {
                    return Err(EngineError::validation(&field.api_name, format!("{} is required", field.label)));
                }
            }
            let Some(value) = value else { continue };
            if value.is_null() {
                continue;
            }
            check_coercion(field, value).map_err(|m| EngineError::validation(&field.api_name, m))?;
            if let Some(name) = field.validator.as_deref() {
                match self.validators.get(&name.to_ascii_lowercase()) {
                    Some(v) => {
                        v.validate(field, value, field.validator_config.as_ref())
                         .map_err(|m| EngineError::validation(&field.api_name, m))?;
                    }
                    None => {
                        return Err(EngineError::validation(&field.api_name, format!("unknown validator '{name}'")));
                    }
                }
            }
        }

        for rule in rules.iter().filter(|r| r.active) {
            let mut ctx = FormulaContext::for_record(record).with_old(old);
            if let Some(u) = user {
                ctx = ctx.with_user(u);
            }
            if FormulaEngine::evaluate_condition(&rule.condition, &ctx)? {
                return Err(EngineError::Rule { message: rule.error_message.clone() });
            }
        }
        Ok(())
    }

    /// Rechaza un segundo flujo Active para el mismo (objeto, disparador).
    pub fn validate_flow(&self, flow: &FlowDef, existing: &[FlowDef]) -> Result<(), EngineError> {
        if !flow.is_active() {
            return Ok(());
        }
        let duplicate = existing.iter().any(|f| {
                                           f.id != flow.id
                                           && f.is_active()
                                           && f.trigger_object.eq_ignore_ascii_case(&flow.trigger_object)
                                           && f.trigger_type == flow.trigger_type
                                       });
        if duplicate {
            return Err(EngineError::Conflict(format!("an active flow already exists for {} {}",
                                                     flow.trigger_object,
                                                     flow.trigger_type.as_str())));
        }
        Ok(())
    }
}

/// Compatibilidad de coerción por tipo. No convierte: sólo decide si la
/// normalización podrá hacerlo.
fn check_coercion(field: &FieldDef, value: &crm_domain::FieldValue) -> Result<(), String> {
    use crm_domain::FieldValue as V;
    match field.field_type {
        FieldType::Boolean => match value {
            V::Bool(_) => Ok(()),
            V::Int(0) | V::Int(1) => Ok(()),
            V::Text(s) if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") => Ok(()),
            _ => Err("expected a boolean".into()),
        },
        FieldType::Number | FieldType::Currency | FieldType::Percent => {
            let n = match value {
                V::Int(i) => Some(*i as f64),
                V::Float(f) => Some(*f),
                V::Text(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            let Some(n) = n else { return Err("expected a number".into()) };
            if let Some(min) = field.min_value {
                if n < min {
                    return Err(format!("must be >= {min}"));
                }
            }
            if let Some(max) = field.max_value {
                if n > max {
                    return Err(format!("must be <= {max}"));
                }
            }
            Ok(())
        }
        FieldType::Text | FieldType::Picklist => {
            let V::Text(s) = value else { return Err("expected text".into()) };
            if let Some(min) = field.min_length {
                if s.chars().count() < min {
                    return Err(format!("must be at least {min} characters"));
                }
            }
            if let Some(max) = field.max_length {
                if s.chars().count() > max {
                    return Err(format!("must be at most {max} characters"));
                }
            }
            if let Some(pattern) = field.regex.as_deref() {
                let re = Regex::new(pattern).map_err(|_| "invalid field pattern".to_string())?;
                if !re.is_match(s) {
                    return Err(field.regex_message.clone().unwrap_or_else(|| "invalid format".into()));
                }
            }
            if field.field_type == FieldType::Picklist
               && !field.options.is_empty()
               && !field.options.iter().any(|o| o == s)
            {
                return Err(format!("'{s}' is not a valid option"));
            }
            Ok(())
        }
        FieldType::Date | FieldType::DateTime => match value {
            V::Timestamp(_) => Ok(()),
            V::Text(s) => {
                let ok = chrono::DateTime::parse_from_rfc3339(s).is_ok()
                         || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();
                if ok {
                    Ok(())
                } else {
                    Err("expected a date (YYYY-MM-DD or RFC3339)".into())
                }
            }
            _ => Err("expected a date".into()),
        },
        FieldType::Lookup => match value {
            V::Text(s) => uuid::Uuid::parse_str(s).map(|_| ()).map_err(|_| "expected a record id".into()),
            _ => Err("expected a record id".into()),
        },
        FieldType::Json => Ok(()),
        // Estampados por el servidor; la normalización los descarta antes.
        FieldType::Formula | FieldType::RollupSummary | FieldType::AutoNumber => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::{FieldValue, SharingModel};
    use uuid::Uuid;

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
        let mut name = FieldDef::new("name", "Name", FieldType::Text);
        name.required = true;
        name.max_length = Some(10);
        obj.add_field(name);
        let mut email = FieldDef::new("contact_email", "Contact Email", FieldType::Text);
        email.validator = Some("email".into());
        obj.add_field(email);
        let mut amount = FieldDef::new("amount", "Amount", FieldType::Number);
        amount.min_value = Some(0.0);
        obj.add_field(amount);
        let mut priority = FieldDef::new("priority", "Priority", FieldType::Picklist);
        priority.options = vec!["Low".into(), "High".into()];
        obj.add_field(priority);
        obj
    }

    fn record(pairs: &[(&str, FieldValue)]) -> SObject {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn required_and_ranges() {
        let v = Validator::new();
        let s = schema();
        let ok = record(&[("name", "Crash".into()), ("amount", FieldValue::Int(3))]);
        assert!(v.validate_record(&ok, &s, &[], None, None).is_ok());

        let missing = record(&[("amount", FieldValue::Int(3))]);
        assert!(matches!(v.validate_record(&missing, &s, &[], None, None),
                         Err(EngineError::Validation { field, .. }) if field == "name"));

        let negative = record(&[("name", "x".into()), ("amount", FieldValue::Float(-1.0))]);
        assert!(v.validate_record(&negative, &s, &[], None, None).is_err());

        // En update, un required ausente del payload se tolera.
        let update = record(&[("amount", FieldValue::Int(5))]);
        let old = record(&[("name", "prev".into())]);
        assert!(v.validate_record(&update, &s, &[], Some(&old), None).is_ok());
    }

    #[test]
    fn named_validator_and_picklist() {
        let v = Validator::new();
        let s = schema();
        let bad_email = record(&[("name", "x".into()), ("contact_email", "nope".into())]);
        assert!(v.validate_record(&bad_email, &s, &[], None, None).is_err());
        let good = record(&[("name", "x".into()), ("contact_email", "a@b.co".into())]);
        assert!(v.validate_record(&good, &s, &[], None, None).is_ok());

        let bad_option = record(&[("name", "x".into()), ("priority", "Medium".into())]);
        assert!(v.validate_record(&bad_option, &s, &[], None, None).is_err());
    }

    #[test]
    fn custom_rule_blocks_when_truthy() {
        let v = Validator::new();
        let s = schema();
        let rule = ValidationRuleDef { id: Uuid::new_v4(),
                                       object_api_name: "ticket".into(),
                                       name: "no_high_without_amount".into(),
                                       condition: "priority == 'High' && ISBLANK(amount)".into(),
                                       error_message: "high priority tickets need an amount".into(),
                                       active: true };
        let bad = record(&[("name", "x".into()), ("priority", "High".into())]);
        match v.validate_record(&bad, &s, std::slice::from_ref(&rule), None, None) {
            Err(EngineError::Rule { message }) => assert!(message.contains("need an amount")),
            other => panic!("expected rule error, got {other:?}"),
        }
        let mut inactive = rule;
        inactive.active = false;
        assert!(v.validate_record(&bad, &s, &[inactive], None, None).is_ok());
    }

    #[test]
    fn duplicate_active_flow_rejected() {
        let v = Validator::new();
        let mk = |id: Uuid, status: crm_domain::FlowStatus| FlowDef { id,
                                                                      name: "f".into(),
                                                                      trigger_object: "Ticket".into(),
                                                                      trigger_type: crm_domain::TriggerType::AfterCreate,
                                                                      trigger_condition: None,
                                                                      flow_type: crm_domain::FlowType::Simple,
                                                                      action_type: Some("SendEmail".into()),
                                                                      action_config: None,
                                                                      status,
                                                                      schedule: None,
                                                                      schedule_timezone: None,
                                                                      next_run_at: None,
                                                                      last_run_at: None,
                                                                      is_running: false };
        let a = mk(Uuid::new_v4(), crm_domain::FlowStatus::Active);
        let b = mk(Uuid::new_v4(), crm_domain::FlowStatus::Active);
        assert!(v.validate_flow(&b, std::slice::from_ref(&a)).is_err());
        // El propio flujo no cuenta como duplicado.
        assert!(v.validate_flow(&a, std::slice::from_ref(&a)).is_ok());
        let draft = mk(Uuid::new_v4(), crm_domain::FlowStatus::Draft);
        assert!(v.validate_flow(&draft, &[a]).is_ok());
    }
}
