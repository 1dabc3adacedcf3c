//! Servicio de acciones: ejecuta la configuración declarativa de un flujo o
//! paso dentro de la transacción del llamador.
//!
//! Resolución de valores de configuración:
//! - String con `{! expr }` o prefijo `=` ⇒ fórmula sobre el registro del
//!   evento (con visibilidad de campos aplicada vía callback).
//! - Objeto `{"step_result": "<id>"}` ⇒ resultado de un paso previo de un
//!   Composite.
//! - Cualquier otro valor ⇒ literal.
//!
//! Claves reconocidas por acción: ver cada handler. `Composite` envuelve sus
//! pasos hijos en una transacción anidada (savepoint).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use diesel::PgConnection;
use log::debug;
use serde_json::Value;
use uuid::Uuid;

use crm_core::actions::{ActionType, CredentialHasher, EmailMessage, EmailSender, WebhookClient, WebhookRequest};
use crm_core::catalog::Catalog;
use crm_core::formula::{formula_body, FormulaContext, FormulaEngine};
use crm_domain::{ApprovalStatus, ApprovalWorkItem, EngineError, FieldValue, SObject, UserContext};
use crm_persistence::tx::run_in_transaction;
use crm_persistence::flow_store;

use crate::permissions::PermissionEngine;
use crate::records::RecordService;

/// Contexto de ejecución de una acción: el evento que la disparó más el
/// linkeo opcional a una instancia multistep.
pub struct ActionCtx<'a> {
    pub object_api_name: &'a str,
    pub record: &'a SObject,
    pub old: Option<&'a SObject>,
    pub user: &'a UserContext,
    pub flow_instance_id: Option<Uuid>,
    pub flow_step_id: Option<Uuid>,
}

pub struct ActionService {
    catalog: Arc<Catalog>,
    records: Arc<RecordService>,
    permissions: Arc<PermissionEngine>,
    email: Arc<dyn EmailSender>,
    webhook: Arc<dyn WebhookClient>,
    hasher: Arc<dyn CredentialHasher>,
}

fn config_of(config: Option<&Value>) -> Result<&serde_json::Map<String, Value>, EngineError> {
    config.and_then(Value::as_object)
          .ok_or_else(|| EngineError::Config("action requires a JSON object config".into()))
}

impl ActionService {
    pub fn new(catalog: Arc<Catalog>, records: Arc<RecordService>, permissions: Arc<PermissionEngine>,
               email: Arc<dyn EmailSender>, webhook: Arc<dyn WebhookClient>, hasher: Arc<dyn CredentialHasher>)
               -> Self {
        Self { catalog,
               records,
               permissions,
               email,
               webhook,
               hasher }
    }

    /// Ejecuta una acción y devuelve su resultado (registro creado/mutado en
    /// JSON, o null para acciones de salida).
    pub fn execute(&self, conn: &mut PgConnection, action_type: &str, config: Option<&Value>, ctx: &ActionCtx<'_>)
                   -> Result<Value, EngineError> {
        let mut step_results = HashMap::new();
        self.execute_with(conn, action_type, config, ctx, &mut step_results, 0)
    }

    fn execute_with(&self, conn: &mut PgConnection, action_type: &str, config: Option<&Value>, ctx: &ActionCtx<'_>,
                    step_results: &mut HashMap<String, Value>, depth: u8)
                    -> Result<Value, EngineError> {
        if depth > 8 {
            return Err(EngineError::Config("action nesting too deep".into()));
        }
        let ty = ActionType::parse(action_type)
            .ok_or_else(|| EngineError::Config(format!("unknown action type '{action_type}'")))?;
        debug!("actions: executing {} on {}", ty.as_str(), ctx.object_api_name);
        match ty {
            ActionType::UpdateRecord => self.update_record(conn, config, ctx, step_results),
            ActionType::CreateRecord => self.create_record(conn, config, ctx, step_results),
            ActionType::SendEmail => self.send_email(conn, config, ctx, step_results),
            ActionType::CallWebhook => self.call_webhook(conn, config, ctx, step_results),
            ActionType::SubmitForApproval => self.submit_for_approval(conn, config, ctx, step_results),
            ActionType::ExecuteAction => {
                let cfg = config_of(config)?;
                let flow_id = cfg.get("flow_id")
                                 .and_then(Value::as_str)
                                 .and_then(|s| Uuid::parse_str(s).ok())
                                 .ok_or_else(|| EngineError::Config("ExecuteAction requires flow_id".into()))?;
                let flows = self.catalog.get_flows()?;
                let saved = flows.iter()
                                 .find(|f| f.id == flow_id)
                                 .ok_or_else(|| EngineError::not_found("flow", flow_id))?;
                let action = saved.action_type
                                  .as_deref()
                                  .ok_or_else(|| EngineError::Config("saved flow has no action".into()))?;
                self.execute_with(conn, action, saved.action_config.as_ref(), ctx, step_results, depth + 1)
            }
            ActionType::Composite => {
                let cfg = config_of(config)?;
                let steps = cfg.get("steps")
                               .and_then(Value::as_array)
                               .ok_or_else(|| EngineError::Config("Composite requires steps".into()))?;
                // Los hijos corren en una transacción anidada propia.
                run_in_transaction(conn, |tx| {
                    for step in steps {
                        let obj = step.as_object()
                                      .ok_or_else(|| EngineError::Config("composite step must be an object".into()))?;
                        let step_id = obj.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                        let step_type = obj.get("type")
                                           .and_then(Value::as_str)
                                           .ok_or_else(|| EngineError::Config("composite step requires type".into()))?;
                        let result = self.execute_with(tx, step_type, Some(step), ctx, step_results, depth + 1)?;
                        if !step_id.is_empty() {
                            step_results.insert(step_id, result);
                        }
                    }
                    Ok(Value::Object(step_results.clone().into_iter().collect()))
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resolución de valores
    // -----------------------------------------------------------------------

    fn resolve_value(&self, conn: &mut PgConnection, raw: &Value, ctx: &ActionCtx<'_>,
                     step_results: &HashMap<String, Value>)
                     -> Result<FieldValue, EngineError> {
        if let Some(reference) = raw.as_object().and_then(|o| o.get("step_result")).and_then(Value::as_str) {
            let value = step_results.get(reference)
                                    .ok_or_else(|| EngineError::Config(format!("unknown step result '{reference}'")))?;
            return Ok(FieldValue::from_json(value));
        }
        let Some(text) = raw.as_str() else { return Ok(FieldValue::from_json(raw)) };
        if formula_body(text).is_none() {
            return Ok(FieldValue::Text(text.to_string()));
        }
        // Fórmula: se evalúa con la visibilidad de campos del usuario.
        let object = self.records
                         .catalog()
                         .get_schema(ctx.object_api_name)?
                         .ok_or_else(|| EngineError::not_found("object", ctx.object_api_name))?;
        let hidden = self.permissions.hidden_fields(conn, ctx.user, &object)?;
        let visible = |field: &str| !hidden.contains(&field.to_ascii_lowercase());
        let fctx = FormulaContext::for_record(ctx.record).with_old(ctx.old)
                                                         .with_user(ctx.user)
                                                         .with_hasher(self.hasher.as_ref())
                                                         .with_visibility(&visible);
        crm_core::formula::resolve_raw(text, &fctx)
    }

    fn resolve_string(&self, conn: &mut PgConnection, cfg: &serde_json::Map<String, Value>, key: &str,
                      ctx: &ActionCtx<'_>, step_results: &HashMap<String, Value>)
                      -> Result<Option<String>, EngineError> {
        match cfg.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => Ok(Some(self.resolve_value(conn, raw, ctx, step_results)?.to_display_string())),
        }
    }

    fn resolve_mappings(&self, conn: &mut PgConnection, cfg: &serde_json::Map<String, Value>, ctx: &ActionCtx<'_>,
                        step_results: &HashMap<String, Value>)
                        -> Result<SObject, EngineError> {
        let mut fields = SObject::new();
        if let Some(mappings) = cfg.get("field_mappings").and_then(Value::as_object) {
            for (field, raw) in mappings {
                fields.set(field.clone(), self.resolve_value(conn, raw, ctx, step_results)?);
            }
        }
        Ok(fields)
    }

    // -----------------------------------------------------------------------
    // Acciones
    // -----------------------------------------------------------------------

    /// UpdateRecord: `field_mappings`, opcional `record_id`, opcional
    /// `target_object` (default: el objeto del evento).
    fn update_record(&self, conn: &mut PgConnection, config: Option<&Value>, ctx: &ActionCtx<'_>,
                     step_results: &HashMap<String, Value>)
                     -> Result<Value, EngineError> {
        let cfg = config_of(config)?;
        let target = cfg.get("target_object")
                        .and_then(Value::as_str)
                        .unwrap_or(ctx.object_api_name)
                        .to_string();
        let record_id = match self.resolve_string(conn, cfg, "record_id", ctx, step_results)? {
            Some(s) => Uuid::parse_str(&s)
                .map_err(|_| EngineError::Config(format!("record_id '{s}' is not a valid id")))?,
            None => ctx.record
                       .id()
                       .ok_or_else(|| EngineError::Config("UpdateRecord without a target record".into()))?,
        };
        let fields = self.resolve_mappings(conn, cfg, ctx, step_results)?;
        let object = self.records
                         .catalog()
                         .get_schema(&target)?
                         .ok_or_else(|| EngineError::not_found("object", &target))?;
        let updated = self.records.update_in_tx(conn, ctx.user, &object, record_id, fields)?;
        Ok(updated.to_json())
    }

    /// CreateRecord: `target_object` (requerido), `field_mappings`.
    fn create_record(&self, conn: &mut PgConnection, config: Option<&Value>, ctx: &ActionCtx<'_>,
                     step_results: &HashMap<String, Value>)
                     -> Result<Value, EngineError> {
        let cfg = config_of(config)?;
        let target = cfg.get("target_object")
                        .and_then(Value::as_str)
                        .ok_or_else(|| EngineError::Config("CreateRecord requires target_object".into()))?
                        .to_string();
        let fields = self.resolve_mappings(conn, cfg, ctx, step_results)?;
        let object = self.records
                         .catalog()
                         .get_schema(&target)?
                         .ok_or_else(|| EngineError::not_found("object", &target))?;
        let created = self.records.insert_in_tx(conn, ctx.user, &object, fields)?;
        Ok(created.to_json())
    }

    /// SendEmail: `to`, `subject`, `body`, opcionales `cc` y `bcc`.
    fn send_email(&self, conn: &mut PgConnection, config: Option<&Value>, ctx: &ActionCtx<'_>,
                  step_results: &HashMap<String, Value>)
                  -> Result<Value, EngineError> {
        let cfg = config_of(config)?;
        let list = |this: &Self, conn: &mut PgConnection, key: &str| -> Result<Vec<String>, EngineError> {
            match cfg.get(key) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(Value::Array(items)) => items.iter()
                                                  .map(|raw| {
                                                      this.resolve_value(conn, raw, ctx, step_results)
                                                          .map(|v| v.to_display_string())
                                                  })
                                                  .collect(),
                Some(raw) => Ok(vec![this.resolve_value(conn, raw, ctx, step_results)?.to_display_string()]),
            }
        };
        let to = list(self, conn, "to")?;
        if to.is_empty() {
            return Err(EngineError::Config("SendEmail requires 'to'".into()));
        }
        let message = EmailMessage { to,
                                     cc: list(self, conn, "cc")?,
                                     bcc: list(self, conn, "bcc")?,
                                     subject: self.resolve_string(conn, cfg, "subject", ctx, step_results)?
                                                  .unwrap_or_default(),
                                     body: self.resolve_string(conn, cfg, "body", ctx, step_results)?
                                               .unwrap_or_default() };
        self.email.send(&message)?;
        Ok(Value::Null)
    }

    /// CallWebhook: `url` (requerido), `method` (default POST), `payload`,
    /// `headers`. Timeout de 30 segundos del lado del cliente.
    fn call_webhook(&self, conn: &mut PgConnection, config: Option<&Value>, ctx: &ActionCtx<'_>,
                    step_results: &HashMap<String, Value>)
                    -> Result<Value, EngineError> {
        let cfg = config_of(config)?;
        let url = self.resolve_string(conn, cfg, "url", ctx, step_results)?
                      .ok_or_else(|| EngineError::Config("CallWebhook requires url".into()))?;
        let method = cfg.get("method").and_then(Value::as_str).unwrap_or("").to_string();
        let payload = match cfg.get("payload") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(self.resolve_value(conn, &Value::String(s.clone()), ctx, step_results)?
                                               .to_json()),
            Some(other) => Some(other.clone()),
        };
        let mut headers = HashMap::new();
        if let Some(map) = cfg.get("headers").and_then(Value::as_object) {
            for (k, v) in map {
                headers.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
        let request = WebhookRequest { url, method, payload, headers };
        request.normalized_method()?;
        self.webhook.call(&request)?;
        Ok(Value::Null)
    }

    /// SubmitForApproval: `approver_formula` (primero) o `approver_id`,
    /// `comments`. Si el contexto viene de un paso multistep, el work item
    /// queda linkeado a la instancia y al paso.
    fn submit_for_approval(&self, conn: &mut PgConnection, config: Option<&Value>, ctx: &ActionCtx<'_>,
                           step_results: &HashMap<String, Value>)
                           -> Result<Value, EngineError> {
        let cfg = config_of(config)?;
        let approver = match cfg.get("approver_formula").and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
            Some(expr) => {
                let fctx = FormulaContext::for_record(ctx.record).with_old(ctx.old)
                                                                 .with_user(ctx.user)
                                                                 .with_hasher(self.hasher.as_ref());
                let value = FormulaEngine::evaluate(expr, &fctx)?;
                value.as_uuid()
                     .ok_or_else(|| EngineError::Config("approver_formula did not yield a user id".into()))?
            }
            None => cfg.get("approver_id")
                       .and_then(Value::as_str)
                       .and_then(|s| Uuid::parse_str(s).ok())
                       .ok_or_else(|| EngineError::Config("SubmitForApproval requires an approver".into()))?,
        };
        let record_id = ctx.record
                           .id()
                           .ok_or_else(|| EngineError::Config("SubmitForApproval without a record id".into()))?;
        let item = ApprovalWorkItem { id: Uuid::new_v4(),
                                      process_id: None,
                                      object_api_name: ctx.object_api_name.to_string(),
                                      record_id,
                                      status: ApprovalStatus::Pending,
                                      submitted_by_id: ctx.user.id,
                                      approver_id: approver,
                                      flow_instance_id: ctx.flow_instance_id,
                                      flow_step_id: ctx.flow_step_id,
                                      comments: self.resolve_string(conn, cfg, "comments", ctx, step_results)?,
                                      submitted_date: Utc::now(),
                                      approved_date: None };
        flow_store::insert_work_item(conn, &item)?;
        Ok(serde_json::to_value(&item).unwrap_or(Value::Null))
    }
}
