//! Runtime persistente de flujos: registro de definiciones, lock de
//! ejecución del scheduler, instancias multistep y work items de aprobación.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crm_domain::{ApprovalStatus, ApprovalWorkItem, EngineError, FlowDef, FlowInstanceState, FlowStepDef,
                 InstanceStatus};

use crate::error::PersistenceError;
use crate::schema::{_system_approval_work_item, _system_flow, _system_flow_instance, _system_flow_step};

// ---------------------------------------------------------------------------
// Definiciones
// ---------------------------------------------------------------------------

pub fn insert_flow(conn: &mut PgConnection, flow: &FlowDef) -> Result<(), EngineError> {
    use crate::schema::_system_flow::dsl as f;
    diesel::insert_into(_system_flow::table)
        .values((f::id.eq(flow.id),
                 f::name.eq(&flow.name),
                 f::trigger_object.eq(&flow.trigger_object),
                 f::trigger_type.eq(flow.trigger_type.as_str()),
                 f::trigger_condition.eq(flow.trigger_condition.as_deref()),
                 f::flow_type.eq(flow.flow_type.as_str()),
                 f::action_type.eq(flow.action_type.as_deref()),
                 f::action_config.eq(flow.action_config.as_ref()),
                 f::status.eq(flow.status.as_str()),
                 f::schedule.eq(flow.schedule.as_deref()),
                 f::schedule_timezone.eq(flow.schedule_timezone.as_deref()),
                 f::next_run_at.eq(flow.next_run_at),
                 f::last_run_at.eq(flow.last_run_at),
                 f::is_running.eq(Some(flow.is_running))))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

pub fn insert_flow_step(conn: &mut PgConnection, step: &FlowStepDef) -> Result<(), EngineError> {
    use crate::schema::_system_flow_step::dsl as s;
    diesel::insert_into(_system_flow_step::table)
        .values((s::id.eq(step.id),
                 s::flow_id.eq(step.flow_id),
                 s::name.eq(&step.name),
                 s::step_order.eq(step.step_order),
                 s::step_type.eq(step.step_type.as_str()),
                 s::action_type.eq(step.action_type.as_deref()),
                 s::action_config.eq(step.action_config.as_ref()),
                 s::on_success_step.eq(step.on_success_step),
                 s::on_failure_step.eq(step.on_failure_step)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lock de ejecución del scheduler
// ---------------------------------------------------------------------------

/// Toma el lock single-writer de un flujo programado:
/// `UPDATE ... SET is_running = true WHERE id = $1 AND (is_running = false OR
/// is_running IS NULL)`. 0 filas ⇒ otro scheduler lo tiene.
pub fn try_claim_scheduled(conn: &mut PgConnection, flow_id: Uuid) -> Result<bool, EngineError> {
    use crate::schema::_system_flow::dsl as f;
    let n = diesel::update(f::_system_flow.filter(f::id.eq(flow_id))
                                          .filter(f::is_running.eq(Some(false)).or(f::is_running.is_null())))
        .set(f::is_running.eq(Some(true)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(n == 1)
}

/// Libera el lock y estampa la corrida: last_run_at = ahora, next_run_at
/// precomputado por el llamador.
pub fn finish_scheduled_run(conn: &mut PgConnection, flow_id: Uuid, last_run: DateTime<Utc>,
                            next_run: Option<DateTime<Utc>>)
                            -> Result<(), EngineError> {
    use crate::schema::_system_flow::dsl as f;
    diesel::update(f::_system_flow.filter(f::id.eq(flow_id)))
        .set((f::is_running.eq(Some(false)), f::last_run_at.eq(Some(last_run)), f::next_run_at.eq(next_run)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

/// Liberación de emergencia del lock (panic o timeout del job).
pub fn release_scheduled(conn: &mut PgConnection, flow_id: Uuid) -> Result<(), EngineError> {
    use crate::schema::_system_flow::dsl as f;
    diesel::update(f::_system_flow.filter(f::id.eq(flow_id))).set(f::is_running.eq(Some(false)))
                                                             .execute(conn)
                                                             .map_err(PersistenceError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Instancias multistep
// ---------------------------------------------------------------------------

type InstanceRow = (Uuid, Uuid, String, Uuid, String, Option<Uuid>, DateTime<Utc>, Option<DateTime<Utc>>,
                    Option<DateTime<Utc>>, Option<Value>);

fn row_to_instance(row: InstanceRow) -> Result<FlowInstanceState, EngineError> {
    let (id, flow_id, object, record, status, current_step, started, paused, completed, context) = row;
    let status = InstanceStatus::parse(&status)
        .ok_or_else(|| EngineError::Internal(format!("bad instance status '{status}'")))?;
    Ok(FlowInstanceState { id,
                           flow_id,
                           object_api_name: object,
                           record_id: record,
                           status,
                           current_step_id: current_step,
                           started_date: started,
                           paused_date: paused,
                           completed_date: completed,
                           context_data: context })
}

pub fn insert_instance(conn: &mut PgConnection, instance: &FlowInstanceState) -> Result<(), EngineError> {
    use crate::schema::_system_flow_instance::dsl as i;
    diesel::insert_into(_system_flow_instance::table)
        .values((i::id.eq(instance.id),
                 i::flow_id.eq(instance.flow_id),
                 i::object_api_name.eq(&instance.object_api_name),
                 i::record_id.eq(instance.record_id),
                 i::status.eq(instance.status.as_str()),
                 i::current_step_id.eq(instance.current_step_id),
                 i::started_date.eq(instance.started_date),
                 i::paused_date.eq(instance.paused_date),
                 i::completed_date.eq(instance.completed_date),
                 i::context_data.eq(instance.context_data.as_ref())))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

/// Lee la instancia con lock de fila (las transiciones del state machine se
/// serializan sobre ella).
pub fn get_instance_locked(conn: &mut PgConnection, instance_id: Uuid)
                           -> Result<Option<FlowInstanceState>, EngineError> {
    use crate::schema::_system_flow_instance::dsl as i;
    let row: Option<InstanceRow> = i::_system_flow_instance.filter(i::id.eq(instance_id))
                                                           .for_update()
                                                           .first(conn)
                                                           .optional()
                                                           .map_err(PersistenceError::from)?;
    row.map(row_to_instance).transpose()
}

pub fn persist_instance_state(conn: &mut PgConnection, instance: &FlowInstanceState) -> Result<(), EngineError> {
    use crate::schema::_system_flow_instance::dsl as i;
    diesel::update(i::_system_flow_instance.filter(i::id.eq(instance.id)))
        .set((i::status.eq(instance.status.as_str()),
              i::current_step_id.eq(instance.current_step_id),
              i::paused_date.eq(instance.paused_date),
              i::completed_date.eq(instance.completed_date),
              i::context_data.eq(instance.context_data.as_ref())))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Work items de aprobación
// ---------------------------------------------------------------------------

type WorkItemRow = (Uuid, Option<Uuid>, String, Uuid, String, Uuid, Uuid, Option<Uuid>, Option<Uuid>, Option<String>,
                    DateTime<Utc>, Option<DateTime<Utc>>);

fn row_to_work_item(row: WorkItemRow) -> Result<ApprovalWorkItem, EngineError> {
    let (id, process, object, record, status, submitted_by, approver, instance, step, comments, submitted, approved) =
        row;
    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| EngineError::Internal(format!("bad work item status '{status}'")))?;
    Ok(ApprovalWorkItem { id,
                          process_id: process,
                          object_api_name: object,
                          record_id: record,
                          status,
                          submitted_by_id: submitted_by,
                          approver_id: approver,
                          flow_instance_id: instance,
                          flow_step_id: step,
                          comments,
                          submitted_date: submitted,
                          approved_date: approved })
}

/// Inserta el work item; un pendiente duplicado para el mismo (registro,
/// aprobador) es un conflicto lógico.
pub fn insert_work_item(conn: &mut PgConnection, item: &ApprovalWorkItem) -> Result<(), EngineError> {
    use crate::schema::_system_approval_work_item::dsl as w;
    let duplicate: bool = diesel::select(diesel::dsl::exists(
        w::_system_approval_work_item.filter(w::record_id.eq(item.record_id))
                                     .filter(w::approver_id.eq(item.approver_id))
                                     .filter(w::status.eq(ApprovalStatus::Pending.as_str())),
    )).get_result(conn)
      .map_err(PersistenceError::from)?;
    if duplicate {
        return Err(EngineError::Conflict(format!("a pending approval already exists for record {}",
                                                 item.record_id)));
    }
    diesel::insert_into(_system_approval_work_item::table)
        .values((w::id.eq(item.id),
                 w::process_id.eq(item.process_id),
                 w::object_api_name.eq(&item.object_api_name),
                 w::record_id.eq(item.record_id),
                 w::status.eq(item.status.as_str()),
                 w::submitted_by_id.eq(item.submitted_by_id),
                 w::approver_id.eq(item.approver_id),
                 w::flow_instance_id.eq(item.flow_instance_id),
                 w::flow_step_id.eq(item.flow_step_id),
                 w::comments.eq(item.comments.as_deref()),
                 w::submitted_date.eq(item.submitted_date),
                 w::approved_date.eq(item.approved_date)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

pub fn get_work_item_locked(conn: &mut PgConnection, item_id: Uuid) -> Result<Option<ApprovalWorkItem>, EngineError> {
    use crate::schema::_system_approval_work_item::dsl as w;
    let row: Option<WorkItemRow> = w::_system_approval_work_item.filter(w::id.eq(item_id))
                                                                .for_update()
                                                                .first(conn)
                                                                .optional()
                                                                .map_err(PersistenceError::from)?;
    row.map(row_to_work_item).transpose()
}

pub fn decide_work_item(conn: &mut PgConnection, item_id: Uuid, decision: ApprovalStatus, comments: Option<&str>)
                        -> Result<(), EngineError> {
    use crate::schema::_system_approval_work_item::dsl as w;
    diesel::update(w::_system_approval_work_item.filter(w::id.eq(item_id)))
        .set((w::status.eq(decision.as_str()), w::approved_date.eq(Some(Utc::now())), w::comments.eq(comments)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

pub fn pending_work_items_for(conn: &mut PgConnection, approver: Uuid) -> Result<Vec<ApprovalWorkItem>, EngineError> {
    use crate::schema::_system_approval_work_item::dsl as w;
    let rows: Vec<WorkItemRow> = w::_system_approval_work_item
        .filter(w::approver_id.eq(approver))
        .filter(w::status.eq(ApprovalStatus::Pending.as_str()))
        .order(w::submitted_date.asc())
        .load(conn)
        .map_err(PersistenceError::from)?;
    rows.into_iter().map(row_to_work_item).collect()
}
