//! `MetadataSource` sobre Postgres: arma el snapshot completo del catálogo.
//!
//! Política de fallos (contrato del catálogo):
//! - Lecturas críticas (objetos, campos, flujos, pasos): cualquier error
//!   aborta la carga y el catálogo retiene el snapshot anterior.
//! - Datos no críticos por objeto (reglas de validación, numeraciones,
//!   reglas de compartición): un fallo se loguea y ese conjunto queda vacío,
//!   sin abortar el refresh.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::warn;
use serde_json::Value;
use uuid::Uuid;

use crm_core::catalog::{CatalogSnapshot, MetadataSource};
use crm_core::flow::machine::ordered_steps;
use crm_domain::{system_fields, AutoNumberDef, DeleteRule, EngineError, FieldDef, FieldType, FlowDef, FlowStatus,
                 FlowStepDef, FlowType, ObjectDef, RollupConfig, SharingModel, SharingRule, StepType, TriggerType,
                 ValidationRuleDef};

use crate::error::PersistenceError;
use crate::tx::ConnectionProvider;

#[derive(Queryable)]
struct ObjectRow {
    _id: Uuid,
    api_name: String,
    label: String,
    plural_label: String,
    description: Option<String>,
    is_custom: bool,
    sharing_model: String,
    app_id: Option<Uuid>,
    table_type: Option<String>,
    list_fields: Option<Value>,
    icon: Option<String>,
    _created_date: DateTime<Utc>,
}

#[derive(Queryable)]
struct FieldRow {
    _id: Uuid,
    object_api_name: String,
    api_name: String,
    label: String,
    field_type: String,
    required: bool,
    is_unique: bool,
    default_value: Option<Value>,
    help_text: Option<String>,
    is_system: bool,
    is_name_field: bool,
    options: Option<Value>,
    min_length: Option<i32>,
    max_length: Option<i32>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    regex: Option<String>,
    regex_message: Option<String>,
    reference_to: Option<Value>,
    is_master_detail: bool,
    delete_rule: Option<String>,
    relationship_name: Option<String>,
    formula: Option<String>,
    return_type: Option<String>,
    rollup_config: Option<Value>,
    validator: Option<String>,
    validator_config: Option<Value>,
}

fn string_list(v: Option<Value>) -> Vec<String> {
    v.and_then(|v| serde_json::from_value::<Vec<String>>(v).ok()).unwrap_or_default()
}

impl FieldRow {
    fn into_def(self) -> Result<FieldDef, EngineError> {
        let field_type = FieldType::parse(&self.field_type)
            .ok_or_else(|| EngineError::Fatal(format!("unknown field type '{}' on {}.{}",
                                                      self.field_type, self.object_api_name, self.api_name)))?;
        let rollup_config: Option<RollupConfig> = match self.rollup_config {
            Some(v) => Some(serde_json::from_value(v).map_err(|e| {
                               EngineError::Fatal(format!("bad rollup_config on {}.{}: {e}",
                                                          self.object_api_name, self.api_name))
                           })?),
            None => None,
        };
        Ok(FieldDef { api_name: self.api_name,
                      label: self.label,
                      field_type,
                      required: self.required,
                      unique: self.is_unique,
                      default_value: self.default_value,
                      help_text: self.help_text,
                      is_system: self.is_system,
                      is_name_field: self.is_name_field,
                      options: string_list(self.options),
                      min_length: self.min_length.map(|v| v as usize),
                      max_length: self.max_length.map(|v| v as usize),
                      min_value: self.min_value,
                      max_value: self.max_value,
                      regex: self.regex,
                      regex_message: self.regex_message,
                      reference_to: string_list(self.reference_to),
                      is_master_detail: self.is_master_detail,
                      delete_rule: self.delete_rule.as_deref().and_then(DeleteRule::parse),
                      relationship_name: self.relationship_name,
                      formula: self.formula,
                      return_type: self.return_type.as_deref().and_then(FieldType::parse),
                      rollup_config,
                      validator: self.validator,
                      validator_config: self.validator_config })
    }
}

#[derive(Queryable)]
struct FlowRow {
    id: Uuid,
    name: String,
    trigger_object: String,
    trigger_type: String,
    trigger_condition: Option<String>,
    flow_type: String,
    action_type: Option<String>,
    action_config: Option<Value>,
    status: String,
    schedule: Option<String>,
    schedule_timezone: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    is_running: Option<bool>,
}

impl FlowRow {
    fn into_def(self) -> Result<FlowDef, EngineError> {
        let trigger_type = TriggerType::parse(&self.trigger_type)
            .ok_or_else(|| EngineError::Fatal(format!("unknown trigger type '{}' on flow {}",
                                                      self.trigger_type, self.name)))?;
        Ok(FlowDef { id: self.id,
                     name: self.name,
                     trigger_object: self.trigger_object,
                     trigger_type,
                     trigger_condition: self.trigger_condition,
                     flow_type: FlowType::parse(&self.flow_type),
                     action_type: self.action_type,
                     action_config: self.action_config,
                     status: FlowStatus::parse(&self.status),
                     schedule: self.schedule,
                     schedule_timezone: self.schedule_timezone,
                     next_run_at: self.next_run_at,
                     last_run_at: self.last_run_at,
                     is_running: self.is_running.unwrap_or(false) })
    }
}

#[derive(Queryable)]
struct FlowStepRow {
    id: Uuid,
    flow_id: Uuid,
    name: String,
    step_order: i32,
    step_type: String,
    action_type: Option<String>,
    action_config: Option<Value>,
    on_success_step: Option<Uuid>,
    on_failure_step: Option<Uuid>,
}

/// Campos de sistema inyectados en todo objeto al cargar el snapshot (no se
/// persisten por objeto en `_system_field`).
fn system_field_defs() -> Vec<FieldDef> {
    let mut defs = Vec::new();
    let mut push = |api: &str, label: &str, ft: FieldType| {
        let mut f = FieldDef::new(api, label, ft);
        f.is_system = true;
        defs.push(f);
    };
    push(system_fields::ID, "Id", FieldType::Lookup);
    push(system_fields::CREATED_DATE, "Created Date", FieldType::DateTime);
    push(system_fields::CREATED_BY_ID, "Created By", FieldType::Lookup);
    push(system_fields::LAST_MODIFIED_DATE, "Last Modified Date", FieldType::DateTime);
    push(system_fields::LAST_MODIFIED_BY_ID, "Last Modified By", FieldType::Lookup);
    push(system_fields::OWNER_ID, "Owner", FieldType::Lookup);
    push(system_fields::IS_DELETED, "Deleted", FieldType::Boolean);
    defs
}

pub struct PgMetadataSource {
    provider: Arc<dyn ConnectionProvider>,
}

impl PgMetadataSource {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }
}

impl MetadataSource for PgMetadataSource {
    fn load_snapshot(&self) -> Result<CatalogSnapshot, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        let mut snapshot = CatalogSnapshot::default();

        // --- críticos: objetos + campos ---
        let object_rows: Vec<ObjectRow> = {
            use crate::schema::_system_object::dsl::*;
            _system_object.load(&mut conn).map_err(PersistenceError::from)?
        };
        let field_rows: Vec<FieldRow> = {
            use crate::schema::_system_field::dsl::*;
            _system_field.load(&mut conn).map_err(PersistenceError::from)?
        };
        let mut fields_by_object: HashMap<String, Vec<FieldDef>> = HashMap::new();
        for row in field_rows {
            let key = row.object_api_name.to_ascii_lowercase();
            fields_by_object.entry(key).or_default().push(row.into_def()?);
        }
        for row in object_rows {
            let key = row.api_name.to_ascii_lowercase();
            let mut object = ObjectDef { api_name: row.api_name,
                                         label: row.label,
                                         plural_label: row.plural_label,
                                         description: row.description,
                                         is_custom: row.is_custom,
                                         sharing_model: SharingModel::parse(&row.sharing_model)
                                             .unwrap_or(SharingModel::Private),
                                         app_id: row.app_id,
                                         table_type: row.table_type,
                                         list_fields: string_list(row.list_fields),
                                         icon: row.icon,
                                         fields: Default::default() };
            for field in system_field_defs() {
                object.add_field(field);
            }
            for field in fields_by_object.remove(&key).unwrap_or_default() {
                object.add_field(field);
            }
            snapshot.objects.insert(key, object);
        }

        // --- críticos: flujos + pasos ---
        let flow_rows: Vec<FlowRow> = {
            use crate::schema::_system_flow::dsl::*;
            _system_flow.load(&mut conn).map_err(PersistenceError::from)?
        };
        for row in flow_rows {
            snapshot.flows.push(row.into_def()?);
        }
        let step_rows: Vec<FlowStepRow> = {
            use crate::schema::_system_flow_step::dsl::*;
            _system_flow_step.load(&mut conn).map_err(PersistenceError::from)?
        };
        for row in step_rows {
            snapshot.flow_steps
                    .entry(row.flow_id)
                    .or_default()
                    .push(FlowStepDef { id: row.id,
                                        flow_id: row.flow_id,
                                        name: row.name,
                                        step_order: row.step_order,
                                        step_type: StepType::parse(&row.step_type),
                                        action_type: row.action_type,
                                        action_config: row.action_config,
                                        on_success_step: row.on_success_step,
                                        on_failure_step: row.on_failure_step });
        }
        for steps in snapshot.flow_steps.values_mut() {
            ordered_steps(steps);
        }

        // --- no críticos por objeto: default vacío ante fallo ---
        snapshot.validation_rules = self.load_validation_rules(&mut conn);
        snapshot.auto_numbers = self.load_auto_numbers(&mut conn);
        snapshot.sharing_rules = self.load_sharing_rules(&mut conn);

        Ok(snapshot)
    }
}

impl PgMetadataSource {
    fn load_validation_rules(&self, conn: &mut PgConnection) -> HashMap<String, Vec<ValidationRuleDef>> {
        use crate::schema::_system_validation_rule::dsl::*;
        type Row = (Uuid, String, String, String, String, bool);
        let rows: Vec<Row> = match _system_validation_rule.load(conn) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("catalog load: validation rules unreadable, defaulting to empty: {e}");
                return HashMap::new();
            }
        };
        let mut out: HashMap<String, Vec<ValidationRuleDef>> = HashMap::new();
        for (rule_id, object, rule_name, cond, message, is_active) in rows {
            out.entry(object.to_ascii_lowercase())
               .or_default()
               .push(ValidationRuleDef { id: rule_id,
                                         object_api_name: object,
                                         name: rule_name,
                                         condition: cond,
                                         error_message: message,
                                         active: is_active });
        }
        out
    }

    fn load_auto_numbers(&self, conn: &mut PgConnection) -> HashMap<String, Vec<AutoNumberDef>> {
        use crate::schema::_system_auto_number::dsl::*;
        type Row = (Uuid, String, String, String, i64);
        let rows: Vec<Row> = match _system_auto_number.load(conn) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("catalog load: auto numbers unreadable, defaulting to empty: {e}");
                return HashMap::new();
            }
        };
        let mut out: HashMap<String, Vec<AutoNumberDef>> = HashMap::new();
        for (_, object, field, format, current) in rows {
            out.entry(object.to_ascii_lowercase())
               .or_default()
               .push(AutoNumberDef { object_api_name: object,
                                     field_api_name: field,
                                     display_format: format,
                                     current_number: current });
        }
        out
    }

    fn load_sharing_rules(&self, conn: &mut PgConnection) -> HashMap<String, Vec<SharingRule>> {
        use crate::schema::_system_sharing_rule::dsl::*;
        type Row = (Uuid, String, Option<String>, String, Option<Uuid>, Option<Uuid>, Option<Uuid>);
        let rows: Vec<Row> = match _system_sharing_rule.load(conn) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("catalog load: sharing rules unreadable, defaulting to empty: {e}");
                return HashMap::new();
            }
        };
        let mut out: HashMap<String, Vec<SharingRule>> = HashMap::new();
        for (rule_id, object, rule_criteria, level, role, user, group) in rows {
            let Some(access) = crm_domain::AccessLevel::parse(&level) else {
                warn!("catalog load: sharing rule {rule_id} has bad access level '{level}', skipped");
                continue;
            };
            out.entry(object.to_ascii_lowercase())
               .or_default()
               .push(SharingRule { id: rule_id,
                                   object_api_name: object,
                                   criteria: rule_criteria,
                                   access_level: access,
                                   share_with_role_id: role,
                                   share_with_user_id: user,
                                   share_with_group_id: group });
        }
        out
    }
}
