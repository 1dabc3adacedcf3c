//! Máquina de estados persistente de flujos multistep.
//!
//! Ciclo de vida: el disparo crea la instancia en Running y ejecuta pasos en
//! orden; un paso de aprobación genera el work item y pausa; la decisión del
//! aprobador resume (arista explícita on_success/on_failure o siguiente por
//! orden) hasta agotar pasos (Completed) o fallar (Failed, con el error en
//! context_data). Toda transición pasa por las reglas del core; una
//! transición inválida es error.

use std::sync::Arc;

use chrono::Utc;
use diesel::PgConnection;
use log::{debug, error, warn};
use serde_json::json;
use uuid::Uuid;

use crm_core::catalog::Catalog;
use crm_core::flow::machine;
use crm_domain::{ApprovalStatus, ApprovalWorkItem, EngineError, FlowDef, FlowInstanceState, FlowStepDef,
                 InstanceStatus, RecordEvent, SObject, StepType, UserContext};
use crm_persistence::tx::{run_in_transaction, ConnectionProvider};
use crm_persistence::{flow_store, record_repo};

use crate::flows::actions::{ActionCtx, ActionService};

pub struct FlowInstanceManager {
    provider: Arc<dyn ConnectionProvider>,
    catalog: Arc<Catalog>,
    actions: Arc<ActionService>,
}

impl FlowInstanceManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>, catalog: Arc<Catalog>, actions: Arc<ActionService>) -> Self {
        Self { provider,
               catalog,
               actions }
    }

    fn transition(&self, conn: &mut PgConnection, instance: &mut FlowInstanceState, to: InstanceStatus)
                  -> Result<(), EngineError> {
        machine::check_transition(instance.status, to)?;
        instance.status = to;
        match to {
            InstanceStatus::Paused => instance.paused_date = Some(Utc::now()),
            InstanceStatus::Running => instance.paused_date = None,
            InstanceStatus::Completed => instance.completed_date = Some(Utc::now()),
            InstanceStatus::Failed => instance.completed_date = Some(Utc::now()),
        }
        flow_store::persist_instance_state(conn, instance)
    }

    /// Marca la instancia como Failed en una conexión propia: el registro del
    /// fallo debe sobrevivir aunque la transacción del paso se revierta.
    fn mark_failed(&self, instance: &FlowInstanceState, error: &EngineError) {
        let mut failed = instance.clone();
        let result = machine::check_transition(failed.status, InstanceStatus::Failed).and_then(|_| {
            failed.status = InstanceStatus::Failed;
            failed.completed_date = Some(Utc::now());
            failed.context_data = Some(json!({ "error": error.to_string() }));
            let mut conn = self.provider.connection().map_err(EngineError::from)?;
            flow_store::persist_instance_state(&mut conn, &failed)
        });
        if let Err(e) = result {
            error!("flow instance {}: could not record failure: {e}", instance.id);
        }
    }

    /// Crea la instancia para un disparo multistep y ejecuta desde el primer
    /// paso (step_order mínimo).
    pub fn start(&self, conn: &mut PgConnection, flow: &FlowDef, event: &RecordEvent) -> Result<(), EngineError> {
        let snapshot = self.catalog.snapshot()?;
        let steps: Vec<FlowStepDef> = snapshot.steps_for_flow(flow.id).to_vec();
        if steps.is_empty() {
            warn!("multistep flow '{}' has no steps, nothing to run", flow.name);
            return Ok(());
        }
        let record_id = event.record_id()
                             .ok_or_else(|| EngineError::Internal("multistep trigger without record id".into()))?;
        let mut instance = FlowInstanceState { id: Uuid::new_v4(),
                                               flow_id: flow.id,
                                               object_api_name: event.object_api_name.clone(),
                                               record_id,
                                               status: InstanceStatus::Running,
                                               current_step_id: None,
                                               started_date: Utc::now(),
                                               paused_date: None,
                                               completed_date: None,
                                               context_data: Some(json!({
                                                   "flow_name": flow.name,
                                                   "trigger": event.kind.event_type(),
                                               })) };
        flow_store::insert_instance(conn, &instance)?;
        debug!("flow instance {} started for {} {}", instance.id, instance.object_api_name, record_id);

        let first = machine::first_step(&steps)
            .ok_or_else(|| EngineError::Internal("step list became empty".into()))?
            .clone();
        self.run_from(conn, &mut instance, &steps, &first, &event.record, &event.user)
    }

    /// Ejecuta pasos linealmente desde `start` hasta pausar en una
    /// aprobación, agotar pasos (Complete) o fallar.
    fn run_from(&self, conn: &mut PgConnection, instance: &mut FlowInstanceState, steps: &[FlowStepDef],
                start: &FlowStepDef, record: &SObject, user: &UserContext)
                -> Result<(), EngineError> {
        let mut current = start.clone();
        loop {
            instance.current_step_id = Some(current.id);
            match current.step_type {
                StepType::Approval => {
                    let ctx = ActionCtx { object_api_name: &instance.object_api_name,
                                          record,
                                          old: None,
                                          user,
                                          flow_instance_id: Some(instance.id),
                                          flow_step_id: Some(current.id) };
                    self.actions
                        .execute(conn, "SubmitForApproval", current.action_config.as_ref(), &ctx)
                        .inspect_err(|e| self.mark_failed(instance, e))?;
                    self.transition(conn, instance, InstanceStatus::Paused)?;
                    debug!("flow instance {} paused at approval step '{}'", instance.id, current.name);
                    return Ok(());
                }
                StepType::Action => {
                    let action_type = current.action_type.clone().ok_or_else(|| {
                                          EngineError::Config(format!("step '{}' has no action type", current.name))
                                      })?;
                    let ctx = ActionCtx { object_api_name: &instance.object_api_name,
                                          record,
                                          old: None,
                                          user,
                                          flow_instance_id: Some(instance.id),
                                          flow_step_id: Some(current.id) };
                    if let Err(e) = self.actions.execute(conn, &action_type, current.action_config.as_ref(), &ctx) {
                        self.mark_failed(instance, &e);
                        return Err(e);
                    }
                }
            }
            match machine::next_step(steps, &current, true) {
                Some(next) => current = next.clone(),
                None => {
                    self.transition(conn, instance, InstanceStatus::Completed)?;
                    debug!("flow instance {} completed", instance.id);
                    return Ok(());
                }
            }
        }
    }

    /// Retoma la instancia tras la decisión de un aprobador, en una única
    /// transacción: siguiente paso por arista explícita o por orden; sin
    /// siguiente paso, Complete.
    pub fn resume_after_approval(&self, conn: &mut PgConnection, item: &ApprovalWorkItem, approved: bool)
                                 -> Result<(), EngineError> {
        let instance_id = item.flow_instance_id
                              .ok_or_else(|| EngineError::Internal("work item not linked to an instance".into()))?;
        let mut instance = flow_store::get_instance_locked(conn, instance_id)?
            .ok_or_else(|| EngineError::not_found("flow_instance", instance_id))?;
        if instance.status != InstanceStatus::Paused {
            return Err(EngineError::Conflict(format!("flow instance {instance_id} is not paused")));
        }

        let snapshot = self.catalog.snapshot()?;
        let steps: Vec<FlowStepDef> = snapshot.steps_for_flow(instance.flow_id).to_vec();
        let current_id = item.flow_step_id
                             .or(instance.current_step_id)
                             .ok_or_else(|| EngineError::Internal("paused instance without current step".into()))?;
        let current = machine::step_by_id(&steps, current_id)
            .ok_or_else(|| EngineError::not_found("flow_step", current_id))?
            .clone();

        let next = machine::next_step(&steps, &current, approved).cloned();
        match next {
            None => {
                self.transition(conn, &mut instance, InstanceStatus::Running)?;
                self.transition(conn, &mut instance, InstanceStatus::Completed)?;
                debug!("flow instance {} completed after {} decision",
                       instance.id,
                       if approved { "approve" } else { "reject" });
                Ok(())
            }
            Some(next) => {
                instance.current_step_id = Some(next.id);
                self.transition(conn, &mut instance, InstanceStatus::Running)?;
                let object = snapshot.object(&instance.object_api_name)
                                     .ok_or_else(|| EngineError::not_found("object", &instance.object_api_name))?;
                let record = record_repo::get(conn, object, instance.record_id)?.unwrap_or_else(|| {
                    let mut minimal = SObject::new();
                    minimal.set(crm_domain::system_fields::ID, instance.record_id);
                    minimal
                });
                // La continuación corre bajo sesión de sistema: el aprobador
                // decidió, el motor ejecuta.
                self.run_from(conn, &mut instance, &steps, &next, &record, &UserContext::system())
            }
        }
    }

    /// Decisión de un work item por parte del aprobador (o un admin). Si el
    /// item pertenece a una instancia multistep, la retoma en la misma
    /// transacción.
    pub fn decide(&self, user: &UserContext, work_item_id: Uuid, approve: bool, comments: Option<&str>)
                  -> Result<(), EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        run_in_transaction(&mut conn, |tx| {
            let item = flow_store::get_work_item_locked(tx, work_item_id)?
                .ok_or_else(|| EngineError::not_found("approval_work_item", work_item_id))?;
            if item.status != ApprovalStatus::Pending {
                return Err(EngineError::Conflict(format!("work item {work_item_id} was already decided")));
            }
            if !user.is_system_admin && item.approver_id != user.id {
                return Err(EngineError::permission("approve", format!("work item {work_item_id}")));
            }
            let decision = if approve { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
            flow_store::decide_work_item(tx, work_item_id, decision, comments)?;
            if item.flow_instance_id.is_some() {
                self.resume_after_approval(tx, &item, approve)?;
            }
            Ok(())
        })
    }
}
