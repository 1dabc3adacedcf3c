//! Permisos end-to-end: jerarquía de roles (lectura hacia abajo, nunca
//! escritura), denegación sin fila de permiso, reglas de compartición y
//! shares manuales. Requiere DATABASE_URL.

mod common;

use common::{harness, object_with, provision, text_field, unique_name, Harness};
use crm_domain::{EngineError, SObject, UserContext};
use diesel::prelude::*;
use uuid::Uuid;

struct Fixture {
    ceo: UserContext,
    manager: UserContext,
    rep: UserContext,
    sibling_rep: UserContext,
}

/// Siembra roles CEO → VP → Manager → Rep, un perfil sin admin y cuatro
/// usuarios con permiso total sobre `object`.
fn seed_hierarchy(h: &Harness, object: &str) -> Fixture {
    let mut conn = h.engine.provider.connection().expect("conn");

    let (ceo_role, vp_role, manager_role, rep_role) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    {
        use crm_persistence::schema::_system_role::dsl as r;
        let rows = vec![(r::id.eq(ceo_role), r::name.eq("CEO"), r::parent_role_id.eq(None::<Uuid>)),
                        (r::id.eq(vp_role), r::name.eq("VP"), r::parent_role_id.eq(Some(ceo_role))),
                        (r::id.eq(manager_role), r::name.eq("Manager"), r::parent_role_id.eq(Some(vp_role))),
                        (r::id.eq(rep_role), r::name.eq("Rep"), r::parent_role_id.eq(Some(manager_role)))];
        diesel::insert_into(r::_system_role).values(rows).execute(&mut conn).expect("roles");
    }

    let profile_id = Uuid::new_v4();
    {
        use crm_persistence::schema::_system_profile::dsl as p;
        diesel::insert_into(p::_system_profile)
            .values((p::id.eq(profile_id), p::name.eq(format!("std_{object}")), p::is_admin.eq(false)))
            .execute(&mut conn)
            .expect("profile");
    }
    {
        use crm_persistence::schema::_system_object_perms::dsl as op;
        diesel::insert_into(op::_system_object_perms)
            .values((op::id.eq(Uuid::new_v4()),
                     op::profile_id.eq(Some(profile_id)),
                     op::permission_set_id.eq(None::<Uuid>),
                     op::object_api_name.eq(object),
                     op::can_read.eq(true),
                     op::can_create.eq(true),
                     op::can_edit.eq(true),
                     op::can_delete.eq(true)))
            .execute(&mut conn)
            .expect("object perms");
    }

    let mut mk_user = |name: &str, role: Uuid| -> UserContext {
        let id = Uuid::new_v4();
        use crm_persistence::schema::_system_user::dsl as u;
        diesel::insert_into(u::_system_user)
            .values((u::id.eq(id),
                     u::username.eq(format!("{name}_{object}")),
                     u::profile_id.eq(Some(profile_id)),
                     u::role_id.eq(Some(role)),
                     u::is_active.eq(true)))
            .execute(&mut conn)
            .expect("user");
        UserContext { id,
                      username: name.to_string(),
                      profile_id: Some(profile_id),
                      permission_set_ids: vec![],
                      role_id: Some(role),
                      is_system_admin: false }
    };
    let ceo = mk_user("ceo", ceo_role);
    let manager = mk_user("manager", manager_role);
    let rep = mk_user("rep", rep_role);
    let sibling_rep = mk_user("sibling", rep_role);
    drop(conn);

    let mut conn = h.engine.provider.connection().expect("conn");
    h.engine.permissions.refresh_role_hierarchy(&mut conn).expect("hierarchy");
    Fixture { ceo,
              manager,
              rep,
              sibling_rep }
}

/// Escenario CEO→VP→Manager→Rep: el manager lee el registro del rep pero no
/// lo edita; el par del rep no lee; el CEO lee.
#[test]
fn role_hierarchy_reads_down_only() {
    let Some(h) = harness() else { return };
    let object = unique_name("pm_deal");
    let def = object_with(&object, vec![text_field("subject")]);
    provision(&h, &def);
    let fx = seed_hierarchy(&h, &object);

    let mut deal = SObject::new();
    deal.set("subject", "rep deal");
    let deal = h.engine.records.insert(&fx.rep, &object, deal).expect("rep inserts own record");
    let deal_id = deal.id().unwrap();

    // Lecturas por jerarquía: manager y CEO (ancestros estrictos) sí.
    assert!(h.engine.records.get(&fx.manager, &object, deal_id).is_ok(), "manager reads downward");
    assert!(h.engine.records.get(&fx.ceo, &object, deal_id).is_ok(), "ceo reads downward");
    // Un par (mismo rol) no es ancestro: denegado.
    assert!(matches!(h.engine.records.get(&fx.sibling_rep, &object, deal_id),
                     Err(EngineError::Permission { .. })));

    // La jerarquía nunca habilita escritura.
    let mut patch = SObject::new();
    patch.set("subject", "manager override");
    assert!(matches!(h.engine.records.update(&fx.manager, &object, deal_id, patch),
                     Err(EngineError::Permission { .. })),
            "hierarchy is read-only");
    assert!(matches!(h.engine.records.delete(&fx.manager, &object, deal_id),
                     Err(EngineError::Permission { .. })));

    // El dueño sí edita.
    let mut own_patch = SObject::new();
    own_patch.set("subject", "rep edit");
    assert!(h.engine.records.update(&fx.rep, &object, deal_id, own_patch).is_ok());

    h.engine.schema_manager.drop_table(&object).expect("cleanup");
}

#[test]
fn no_permission_row_denies_object_access() {
    let Some(h) = harness() else { return };
    let object = unique_name("pm_locked");
    let def = object_with(&object, vec![text_field("subject")]);
    provision(&h, &def);

    // Usuario sin perfil ni permission sets: sin fila aplicable ⇒ denegar.
    let outsider = UserContext { id: Uuid::new_v4(),
                                 username: "outsider".into(),
                                 profile_id: None,
                                 permission_set_ids: vec![],
                                 role_id: None,
                                 is_system_admin: false };
    let mut rec = SObject::new();
    rec.set("subject", "x");
    assert!(matches!(h.engine.records.insert(&outsider, &object, rec),
                     Err(EngineError::Permission { .. })));

    h.engine.schema_manager.drop_table(&object).expect("cleanup");
}

#[test]
fn manual_share_grants_read_then_edit() {
    let Some(h) = harness() else { return };
    let object = unique_name("pm_shared");
    let def = object_with(&object, vec![text_field("subject")]);
    provision(&h, &def);
    let fx = seed_hierarchy(&h, &object);

    let mut deal = SObject::new();
    deal.set("subject", "shared deal");
    let deal = h.engine.records.insert(&fx.rep, &object, deal).expect("insert");
    let deal_id = deal.id().unwrap();

    // Sin share: el par no accede.
    assert!(h.engine.records.get(&fx.sibling_rep, &object, deal_id).is_err());

    // Share manual Read: lectura sí, edición no.
    {
        let mut conn = h.engine.provider.connection().expect("conn");
        use crm_persistence::schema::_system_record_share::dsl as s;
        diesel::insert_into(s::_system_record_share)
            .values((s::id.eq(Uuid::new_v4()),
                     s::object_api_name.eq(&def.api_name),
                     s::record_id.eq(deal_id),
                     s::user_id.eq(Some(fx.sibling_rep.id)),
                     s::group_id.eq(None::<Uuid>),
                     s::access_level.eq("Read")))
            .execute(&mut conn)
            .expect("share");
    }
    assert!(h.engine.records.get(&fx.sibling_rep, &object, deal_id).is_ok());
    let mut patch = SObject::new();
    patch.set("subject", "peer edit");
    assert!(h.engine.records.update(&fx.sibling_rep, &object, deal_id, patch.clone()).is_err());

    // Subir el share a Edit habilita la edición (Edit ⇒ read+edit).
    {
        let mut conn = h.engine.provider.connection().expect("conn");
        use crm_persistence::schema::_system_record_share::dsl as s;
        diesel::update(s::_system_record_share.filter(s::record_id.eq(deal_id)))
            .set(s::access_level.eq("Edit"))
            .execute(&mut conn)
            .expect("upgrade share");
    }
    assert!(h.engine.records.update(&fx.sibling_rep, &object, deal_id, patch).is_ok());

    h.engine.schema_manager.drop_table(&object).expect("cleanup");
}
