//! CRUD end-to-end sobre objetos dirigidos por metadatos: inserción con
//! estampado de sistema y numeración automática, update con auditoría,
//! unicidad, soft-delete con papelera, restore y purge.
//! Requiere DATABASE_URL.

mod common;

use common::{drain_outbox, harness, object_with, provision, text_field, unique_name};
use crm_domain::{EngineError, FieldDef, FieldType, FieldValue, SObject, UserContext};
use crm_persistence::audit;

#[test]
fn insert_update_delete_round_trip() {
    let Some(h) = harness() else { return };
    let name = unique_name("crud_ticket");
    let mut number = FieldDef::new("ticket_number", "Ticket Number", FieldType::AutoNumber);
    number.default_value = Some(serde_json::json!("TCK-{0000}"));
    let mut priority = FieldDef::new("priority", "Priority", FieldType::Picklist);
    priority.options = vec!["Low".into(), "High".into()];
    let mut subject = text_field("subject");
    subject.required = true;
    let def = object_with(&name, vec![subject, priority, number]);
    provision(&h, &def);

    let admin = UserContext::system();
    let mut input = SObject::new();
    input.set("SUBJECT", "Crash on save"); // clave con otra grafía
    input.set("priority", "High");
    let created = h.engine.records.insert(&admin, &name, input).expect("insert");

    let id = created.id().expect("id stamped");
    assert_eq!(created.get_str("subject"), Some("Crash on save"));
    assert_eq!(created.get_str("ticket_number"), Some("TCK-0001"));
    assert!(created.get(crm_domain::system_fields::CREATED_DATE).is_some());
    assert_eq!(created.get_uuid(crm_domain::system_fields::OWNER_ID), Some(admin.id));

    // Segundo insert: la numeración avanza bajo lock.
    let mut second = SObject::new();
    second.set("subject", "Another");
    let second = h.engine.records.insert(&admin, &name, second).expect("insert 2");
    assert_eq!(second.get_str("ticket_number"), Some("TCK-0002"));

    // Update: sólo el campo cambiado queda auditado.
    let mut patch = SObject::new();
    patch.set("priority", "Low");
    patch.set("subject", "Crash on save"); // sin cambio real
    let updated = h.engine.records.update(&admin, &name, id, patch).expect("update");
    assert_eq!(updated.get_str("priority"), Some("Low"));

    {
        let mut conn = h.engine.provider.connection().expect("conn");
        let rows = audit::list_for_record(&mut conn, &def.api_name, id).expect("audit");
        assert_eq!(rows.len(), 1, "only the changed field is audited");
        assert_eq!(rows[0].field_api_name, "priority");
        assert_eq!(rows[0].old_value.as_deref(), Some("High"));
        assert_eq!(rows[0].new_value.as_deref(), Some("Low"));
    }

    // Soft delete: desaparece de las lecturas y entra a la papelera.
    h.engine.records.delete(&admin, &name, id).expect("delete");
    assert!(matches!(h.engine.records.get(&admin, &name, id), Err(EngineError::NotFound { .. })));
    {
        let mut conn = h.engine.provider.connection().expect("conn");
        assert!(audit::recycle_bin_contains(&mut conn, id).expect("bin"));
    }

    // Restore la trae de vuelta; purge la elimina físicamente.
    h.engine.records.restore(&admin, &name, id).expect("restore");
    let back = h.engine.records.get(&admin, &name, id).expect("get after restore");
    assert_eq!(back.get(crm_domain::system_fields::IS_DELETED), Some(&FieldValue::Bool(false)));

    h.engine.records.delete(&admin, &name, id).expect("delete again");
    h.engine.records.purge(&admin, &name, id).expect("purge");
    {
        let mut conn = h.engine.provider.connection().expect("conn");
        assert!(!audit::recycle_bin_contains(&mut conn, id).expect("bin"));
    }
    drain_outbox(&h, 2);
    h.engine.schema_manager.drop_table(&name).expect("cleanup");
}

#[test]
fn unique_fields_conflict() {
    let Some(h) = harness() else { return };
    let name = unique_name("crud_uni");
    let mut email = text_field("email");
    email.unique = true;
    let def = object_with(&name, vec![text_field("subject"), email]);
    provision(&h, &def);
    let admin = UserContext::system();

    let mut first = SObject::new();
    first.set("email", "dup@example.test");
    h.engine.records.insert(&admin, &name, first).expect("first insert");

    let mut second = SObject::new();
    second.set("email", "dup@example.test");
    assert!(matches!(h.engine.records.insert(&admin, &name, second), Err(EngineError::Conflict(_))));
    h.engine.schema_manager.drop_table(&name).expect("cleanup");
}

#[test]
fn validation_and_rules_block_writes() {
    let Some(h) = harness() else { return };
    let name = unique_name("crud_val");
    let mut subject = text_field("subject");
    subject.required = true;
    let mut amount = FieldDef::new("amount", "Amount", FieldType::Number);
    amount.min_value = Some(0.0);
    let def = object_with(&name, vec![subject, amount]);
    provision(&h, &def);
    let admin = UserContext::system();

    let mut missing = SObject::new();
    missing.set("amount", 10i64);
    assert!(matches!(h.engine.records.insert(&admin, &name, missing),
                     Err(EngineError::Validation { field, .. }) if field == "subject"));

    let mut negative = SObject::new();
    negative.set("subject", "x");
    negative.set("amount", -5i64);
    assert!(h.engine.records.insert(&admin, &name, negative).is_err());
    h.engine.schema_manager.drop_table(&name).expect("cleanup");
}

#[test]
fn master_detail_cascades_soft_delete() {
    let Some(h) = harness() else { return };
    let parent_name = unique_name("crud_parent");
    let child_name = unique_name("crud_child");
    let parent = object_with(&parent_name, vec![text_field("subject")]);
    provision(&h, &parent);

    let mut link = FieldDef::new("parent_id", "Parent", FieldType::Lookup);
    link.reference_to = vec![parent_name.clone()];
    link.required = true;
    link.is_master_detail = true;
    link.delete_rule = Some(crm_domain::DeleteRule::Cascade);
    let child = object_with(&child_name, vec![link, text_field("detail")]);
    provision(&h, &child);

    let admin = UserContext::system();
    let mut p = SObject::new();
    p.set("subject", "parent");
    let p = h.engine.records.insert(&admin, &parent_name, p).expect("parent");
    let parent_id = p.id().unwrap();

    let mut c = SObject::new();
    c.set("parent_id", parent_id);
    c.set("detail", "child");
    let c = h.engine.records.insert(&admin, &child_name, c).expect("child");
    let child_id = c.id().unwrap();

    // Cascade: borrar el padre soft-borra al hijo.
    h.engine.records.delete(&admin, &parent_name, parent_id).expect("cascade delete");
    assert!(matches!(h.engine.records.get(&admin, &child_name, child_id), Err(EngineError::NotFound { .. })));

    h.engine.schema_manager.drop_table(&child_name).expect("cleanup child");
    h.engine.schema_manager.drop_table(&parent_name).expect("cleanup parent");
}
