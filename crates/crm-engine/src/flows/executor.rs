//! Ejecutor de flujos: suscripto a todos los eventos de ciclo de vida,
//! matchea flujos Activos por (objeto, disparador) case-insensitive, evalúa
//! la condición de disparo y despacha la acción o la secuencia multistep.
//!
//! Política de fallos:
//! - Eventos before: el primer error aborta (forma parte de la transacción de
//!   negocio).
//! - Eventos after: se ejecutan todos los flujos aunque alguno falle; el
//!   primer error se devuelve al worker del outbox para que el evento
//!   reintente.

use std::sync::Arc;

use diesel::PgConnection;
use log::{debug, error, warn};

use crm_core::actions::{ActionType, CredentialHasher};
use crm_core::catalog::Catalog;
use crm_core::formula::{FormulaContext, FormulaEngine};
use crm_domain::{EngineError, FieldValue, FlowDef, RecordEvent};

use crate::bus::EventHandler;
use crate::flows::actions::{ActionCtx, ActionService};
use crate::flows::instances::FlowInstanceManager;

pub struct FlowExecutor {
    catalog: Arc<Catalog>,
    actions: Arc<ActionService>,
    instances: Arc<FlowInstanceManager>,
    hasher: Arc<dyn CredentialHasher>,
}

impl FlowExecutor {
    pub fn new(catalog: Arc<Catalog>, actions: Arc<ActionService>, instances: Arc<FlowInstanceManager>,
               hasher: Arc<dyn CredentialHasher>)
               -> Self {
        Self { catalog,
               actions,
               instances,
               hasher }
    }

    fn condition_holds(&self, flow: &FlowDef, event: &RecordEvent) -> bool {
        let Some(condition) = flow.trigger_condition.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
            return true;
        };
        let ctx = FormulaContext::for_record(&event.record).with_old(event.old.as_ref())
                                                           .with_user(&event.user)
                                                           .with_hasher(self.hasher.as_ref());
        match FormulaEngine::evaluate_condition(condition, &ctx) {
            Ok(holds) => holds,
            Err(e) => {
                // Una condición rota nunca dispara el flujo.
                warn!("flow '{}': trigger condition failed to evaluate: {e}", flow.name);
                false
            }
        }
    }

    fn run_flow(&self, conn: &mut PgConnection, flow: &FlowDef, event: &mut RecordEvent)
                -> Result<(), EngineError> {
        debug!("flow '{}' firing on {} {}", flow.name, event.kind.event_type(), event.object_api_name);
        if flow.is_multistep() {
            return self.instances.start(conn, flow, event);
        }
        let action_type = flow.action_type
                              .as_deref()
                              .ok_or_else(|| EngineError::Config(format!("flow '{}' has no action", flow.name)))?;

        // UpdateRecord sobre un disparador before muta el registro en
        // memoria: el write posterior del envelope lo persiste.
        if event.kind.is_before() && ActionType::parse(action_type) == Some(ActionType::UpdateRecord) {
            let mappings = flow.action_config
                               .as_ref()
                               .and_then(|c| c.get("field_mappings"))
                               .and_then(|m| m.as_object())
                               .cloned()
                               .unwrap_or_default();
            let mut resolved: Vec<(String, FieldValue)> = Vec::with_capacity(mappings.len());
            {
                let ctx = FormulaContext::for_record(&event.record).with_old(event.old.as_ref())
                                                                   .with_user(&event.user)
                                                                   .with_hasher(self.hasher.as_ref());
                for (field, raw) in &mappings {
                    let value = match raw.as_str() {
                        Some(text) => crm_core::formula::resolve_raw(text, &ctx)?,
                        None => FieldValue::from_json(raw),
                    };
                    resolved.push((field.clone(), value));
                }
            }
            for (field, value) in resolved {
                event.record.set(field, value);
            }
            return Ok(());
        }

        let ctx = ActionCtx { object_api_name: &event.object_api_name,
                              record: &event.record,
                              old: event.old.as_ref(),
                              user: &event.user,
                              flow_instance_id: None,
                              flow_step_id: None };
        self.actions.execute(conn, action_type, flow.action_config.as_ref(), &ctx)?;
        Ok(())
    }
}

impl EventHandler for FlowExecutor {
    fn handle(&self, conn: &mut PgConnection, event: &mut RecordEvent) -> Result<(), EngineError> {
        // Un evento de un objeto que este snapshot no conoce indica metadatos
        // registrados después de la última carga: se invalida y la próxima
        // lectura refresca antes de matchear flujos.
        if self.catalog.snapshot()?.object(&event.object_api_name).is_none() {
            self.catalog.invalidate_cache();
        }
        let trigger = event.kind.trigger_type();
        let flows: Vec<FlowDef> = self.catalog
                                      .get_flows()?
                                      .into_iter()
                                      .filter(|f| {
                                          f.is_active()
                                          && f.trigger_type == trigger
                                          && f.trigger_object.eq_ignore_ascii_case(&event.object_api_name)
                                      })
                                      .collect();
        let mut first_error: Option<EngineError> = None;
        for flow in &flows {
            if !self.condition_holds(flow, event) {
                continue;
            }
            if let Err(e) = self.run_flow(conn, flow, event) {
                if event.kind.is_before() {
                    return Err(e);
                }
                // Flujos independientes: uno roto no frena a los demás, pero
                // el evento queda en retry.
                error!("flow '{}' failed on {}: {e}", flow.name, event.kind.event_type());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
