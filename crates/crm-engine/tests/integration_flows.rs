//! Flujos end-to-end: disparo condicional con acción CreateRecord, hashing
//! de credenciales en un before-trigger y la secuencia multistep con
//! aprobación (pausa, resume, rechazo). Requiere DATABASE_URL.

mod common;

use common::{drain_outbox, harness, object_with, provision, text_field, unique_name, Harness};
use crm_core::actions::CredentialHasher;
use crm_domain::{ApprovalStatus, FieldDef, FieldType, FlowDef, FlowStatus, FlowType, InstanceStatus, SObject,
                 StepType, TriggerType, UserContext};
use crm_persistence::flow_store;
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn register_flow(h: &Harness, flow: &FlowDef) {
    let mut conn = h.engine.provider.connection().expect("conn");
    flow_store::insert_flow(&mut conn, flow).expect("insert flow");
    h.engine.invalidate_metadata();
}

fn simple_flow(name: &str, object: &str, trigger: TriggerType, condition: Option<&str>, action: &str,
               config: serde_json::Value)
               -> FlowDef {
    FlowDef { id: Uuid::new_v4(),
              name: name.to_string(),
              trigger_object: object.to_string(),
              trigger_type: trigger,
              trigger_condition: condition.map(str::to_string),
              flow_type: FlowType::Simple,
              action_type: Some(action.to_string()),
              action_config: Some(config),
              status: FlowStatus::Active,
              schedule: None,
              schedule_timezone: None,
              next_run_at: None,
              last_run_at: None,
              is_running: false }
}

/// Escenario "alerta de prioridad alta": un afterCreate condicionado crea un
/// segundo registro sólo cuando la condición es verdadera.
#[test]
fn conditional_after_create_fires_create_record() {
    let Some(h) = harness() else { return };
    let ticket_name = unique_name("fl_ticket");
    let mut priority = FieldDef::new("priority", "Priority", FieldType::Picklist);
    priority.options = vec!["Low".into(), "High".into()];
    let def = object_with(&ticket_name, vec![text_field("subject"), priority]);
    provision(&h, &def);

    register_flow(&h,
                  &simple_flow("high_priority_alert",
                               &ticket_name,
                               TriggerType::AfterCreate,
                               Some(r#"priority == "High""#),
                               "CreateRecord",
                               json!({
                                   "target_object": ticket_name,
                                   "field_mappings": {
                                       "subject": "=CONCAT('escalation: ', subject)",
                                       "priority": "Low",
                                   },
                               })));

    let admin = UserContext::system();
    let mut high = SObject::new();
    high.set("subject", "Crash");
    high.set("priority", "High");
    h.engine.records.insert(&admin, &ticket_name, high).expect("insert high");
    drain_outbox(&h, 3);

    let mut conn = h.engine.provider.connection().expect("conn");
    let count = |conn: &mut diesel::PgConnection| -> i64 {
        #[derive(diesel::QueryableByName)]
        struct CountRow {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            n: i64,
        }
        let row: CountRow = diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {ticket_name}"))
            .get_result(conn)
            .expect("count");
        row.n
    };
    assert_eq!(count(&mut conn), 2, "the flow created the escalation ticket");

    // Prioridad baja: la condición no matchea y no hay segundo registro.
    let mut low = SObject::new();
    low.set("subject", "Typo");
    low.set("priority", "Low");
    h.engine.records.insert(&admin, &ticket_name, low).expect("insert low");
    drain_outbox(&h, 3);
    assert_eq!(count(&mut conn), 3, "low priority insert adds only itself");

    h.engine.schema_manager.drop_table(&ticket_name).expect("cleanup");
}

/// Escenario "hashing de password": un beforeCreate con UpdateRecord y
/// mapeo `=BCRYPT(password)` muta el registro en memoria antes del write.
#[test]
fn before_create_hashes_credential() {
    let Some(h) = harness() else { return };
    let user_obj = unique_name("fl_account_user");
    let def = object_with(&user_obj, vec![text_field("username"), text_field("password")]);
    provision(&h, &def);

    register_flow(&h,
                  &simple_flow("hash_password",
                               &user_obj,
                               TriggerType::BeforeCreate,
                               None,
                               "UpdateRecord",
                               json!({ "field_mappings": { "password": "=BCRYPT(password)" } })));

    let admin = UserContext::system();
    let mut input = SObject::new();
    input.set("username", "ada");
    input.set("password", "SecurePass123!");
    let created = h.engine.records.insert(&admin, &user_obj, input).expect("insert");

    let stored = created.get_str("password").expect("password present");
    assert_ne!(stored, "SecurePass123!", "plaintext must not be stored");
    assert!(h.hasher.verify("SecurePass123!", stored), "hash verifies against the original");
    assert!(!h.hasher.verify("WrongPass", stored));

    // La fila persistida también lleva el hash.
    let reloaded = h.engine.records.get(&admin, &user_obj, created.id().unwrap()).expect("get");
    assert_eq!(reloaded.get_str("password"), Some(stored));

    h.engine.schema_manager.drop_table(&user_obj).expect("cleanup");
}

fn multistep_fixture(h: &Harness, object: &str, approver: Uuid) -> FlowDef {
    let flow = FlowDef { id: Uuid::new_v4(),
                         name: format!("approval_{object}"),
                         trigger_object: object.to_string(),
                         trigger_type: TriggerType::AfterCreate,
                         trigger_condition: None,
                         flow_type: FlowType::Multistep,
                         action_type: None,
                         action_config: None,
                         status: FlowStatus::Active,
                         schedule: None,
                         schedule_timezone: None,
                         next_run_at: None,
                         last_run_at: None,
                         is_running: false };
    let mut conn = h.engine.provider.connection().expect("conn");
    flow_store::insert_flow(&mut conn, &flow).expect("flow");
    let approval = crm_domain::FlowStepDef { id: Uuid::new_v4(),
                                             flow_id: flow.id,
                                             name: "manager sign-off".into(),
                                             step_order: 10,
                                             step_type: StepType::Approval,
                                             action_type: None,
                                             action_config: Some(json!({ "approver_id": approver.to_string() })),
                                             on_success_step: None,
                                             on_failure_step: None };
    let apply = crm_domain::FlowStepDef { id: Uuid::new_v4(),
                                          flow_id: flow.id,
                                          name: "mark approved".into(),
                                          step_order: 20,
                                          step_type: StepType::Action,
                                          action_type: Some("UpdateRecord".into()),
                                          action_config: Some(json!({
                                              "field_mappings": { "status": "Approved" },
                                          })),
                                          on_success_step: None,
                                          on_failure_step: None };
    flow_store::insert_flow_step(&mut conn, &approval).expect("step 1");
    flow_store::insert_flow_step(&mut conn, &apply).expect("step 2");
    h.engine.invalidate_metadata();
    flow
}

fn instance_for(h: &Harness, flow_id: Uuid) -> crm_domain::FlowInstanceState {
    use crm_persistence::schema::_system_flow_instance::dsl as i;
    let mut conn = h.engine.provider.connection().expect("conn");
    type Row = (Uuid, Uuid, String, Uuid, String, Option<Uuid>, chrono::DateTime<chrono::Utc>,
                Option<chrono::DateTime<chrono::Utc>>, Option<chrono::DateTime<chrono::Utc>>,
                Option<serde_json::Value>);
    let rows: Vec<Row> = i::_system_flow_instance.filter(i::flow_id.eq(flow_id)).load(&mut conn).expect("instances");
    assert_eq!(rows.len(), 1, "exactly one instance per trigger");
    let (id, flow_id, object, record, status, step, started, paused, completed, ctx) = rows.into_iter().next().unwrap();
    crm_domain::FlowInstanceState { id,
                                    flow_id,
                                    object_api_name: object,
                                    record_id: record,
                                    status: InstanceStatus::parse(&status).expect("status"),
                                    current_step_id: step,
                                    started_date: started,
                                    paused_date: paused,
                                    completed_date: completed,
                                    context_data: ctx }
}

/// Escenario multistep: Running → Paused en la aprobación, work item
/// Pending; aprobar resume y ejecuta el paso 2; la instancia completa.
#[test]
fn multistep_approval_approve_path() {
    let Some(h) = harness() else { return };
    let object = unique_name("fl_req");
    let mut status = FieldDef::new("status", "Status", FieldType::Picklist);
    status.options = vec!["Draft".into(), "Approved".into()];
    let def = object_with(&object, vec![text_field("subject"), status]);
    provision(&h, &def);
    let approver = Uuid::new_v4();
    let flow = multistep_fixture(&h, &object, approver);

    let admin = UserContext::system();
    let mut req = SObject::new();
    req.set("subject", "need laptop");
    req.set("status", "Draft");
    let req = h.engine.records.insert(&admin, &object, req).expect("insert");
    drain_outbox(&h, 3);

    let instance = instance_for(&h, flow.id);
    assert_eq!(instance.status, InstanceStatus::Paused, "paused at the approval step");
    assert!(instance.paused_date.is_some());

    let mut conn = h.engine.provider.connection().expect("conn");
    let pending = flow_store::pending_work_items_for(&mut conn, approver).expect("work items");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, ApprovalStatus::Pending);
    assert_eq!(pending[0].record_id, req.id().unwrap());
    drop(conn);

    // Decisión del aprobador: resume y ejecuta el UpdateRecord del paso 2.
    let approver_session = UserContext { id: approver,
                                         username: "approver".into(),
                                         profile_id: None,
                                         permission_set_ids: vec![],
                                         role_id: None,
                                         is_system_admin: false };
    h.engine.instances.decide(&approver_session, pending[0].id, true, Some("ok")).expect("approve");

    let instance = instance_for(&h, flow.id);
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.completed_date.is_some());
    let record = h.engine.records.get(&admin, &object, req.id().unwrap()).expect("get");
    assert_eq!(record.get_str("status"), Some("Approved"), "step 2 ran after approval");

    h.engine.schema_manager.drop_table(&object).expect("cleanup");
}

/// Rechazo: la instancia completa sin ejecutar el paso 2.
#[test]
fn multistep_approval_reject_path() {
    let Some(h) = harness() else { return };
    let object = unique_name("fl_rej");
    let mut status = FieldDef::new("status", "Status", FieldType::Picklist);
    status.options = vec!["Draft".into(), "Approved".into()];
    let def = object_with(&object, vec![text_field("subject"), status]);
    provision(&h, &def);
    let approver = Uuid::new_v4();
    let flow = multistep_fixture(&h, &object, approver);

    let admin = UserContext::system();
    let mut req = SObject::new();
    req.set("subject", "need pony");
    req.set("status", "Draft");
    let req = h.engine.records.insert(&admin, &object, req).expect("insert");
    drain_outbox(&h, 3);

    let mut conn = h.engine.provider.connection().expect("conn");
    let pending = flow_store::pending_work_items_for(&mut conn, approver).expect("work items");
    drop(conn);
    assert_eq!(pending.len(), 1);

    h.engine.instances.decide(&UserContext::system(), pending[0].id, false, Some("no")).expect("reject");

    let instance = instance_for(&h, flow.id);
    assert_eq!(instance.status, InstanceStatus::Completed, "rejection ends the flow");
    let record = h.engine.records.get(&admin, &object, req.id().unwrap()).expect("get");
    assert_eq!(record.get_str("status"), Some("Draft"), "step 2 must not run on rejection");

    h.engine.schema_manager.drop_table(&object).expect("cleanup");
}
