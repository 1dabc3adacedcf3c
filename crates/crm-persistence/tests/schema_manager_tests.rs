//! Schema manager contra Postgres real: atomicidad DDL-metadatos, adopción
//! de huérfanos y columnas fantasma. Requiere DATABASE_URL.

use std::sync::Arc;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;

use crm_domain::{FieldDef, FieldType, ObjectDef, SharingModel};
use crm_persistence::config::DbConfig;
use crm_persistence::schema_manager::SchemaManager;
use crm_persistence::tx::{build_pool, ConnectionProvider, PoolProvider};

fn setup() -> Option<(Arc<PoolProvider>, SchemaManager)> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return None;
    }
    let cfg = DbConfig::from_env();
    let pool = build_pool(&cfg.url, 1, 4).expect("pool");
    let provider = Arc::new(PoolProvider { pool });
    let manager = SchemaManager::new(provider.clone());
    Some((provider, manager))
}

fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..10])
}

fn object_with(api_name: &str, fields: Vec<FieldDef>) -> ObjectDef {
    let mut obj = ObjectDef { api_name: api_name.to_string(),
                              label: api_name.to_string(),
                              plural_label: format!("{api_name}s"),
                              description: None,
                              is_custom: true,
                              sharing_model: SharingModel::Private,
                              app_id: None,
                              table_type: None,
                              list_fields: vec![],
                              icon: None,
                              fields: Default::default() };
    for f in fields {
        obj.add_field(f);
    }
    obj
}

fn table_exists(conn: &mut PgConnection, table: &str) -> bool {
    diesel::sql_query("SELECT 1 FROM information_schema.tables WHERE table_name = $1")
        .bind::<diesel::sql_types::Text, _>(table)
        .execute(conn)
        .map(|n| n > 0)
        .unwrap_or(false)
}

#[test]
fn create_table_registers_metadata() {
    let Some((provider, manager)) = setup() else { return };
    let name = unique_name("sm_create");
    let mut amount = FieldDef::new("amount", "Amount", FieldType::Number);
    amount.min_value = Some(0.0);
    let def = object_with(&name, vec![FieldDef::new("name", "Name", FieldType::Text), amount]);

    manager.create_table_from_definition(&def).expect("create");
    let mut conn = provider.connection().expect("conn");
    assert!(table_exists(&mut conn, &name));
    {
        use crm_persistence::schema::_system_object::dsl as o;
        let count: i64 = o::_system_object.filter(o::api_name.eq(&name)).count().get_result(&mut conn).unwrap();
        assert_eq!(count, 1);
    }
    manager.drop_table(&name).expect("drop");
    assert!(!table_exists(&mut conn, &name));
}

#[test]
fn failed_registration_drops_physical_table() {
    let Some((provider, manager)) = setup() else { return };
    let name = unique_name("sm_atomic");
    let def = object_with(&name, vec![FieldDef::new("name", "Name", FieldType::Text)]);

    // Pre-inserta la fila de objeto: el registro de metadatos choca contra el
    // unique de api_name y debe compensar dropeando la tabla física.
    {
        let mut conn = provider.connection().expect("conn");
        conn.batch_execute(&format!("INSERT INTO _system_object (api_name, label, plural_label) \
                                     VALUES ('{name}', 'x', 'xs')"))
            .expect("seed conflicting object row");
    }
    let result = manager.create_table_from_definition(&def);
    assert!(result.is_err(), "expected registration conflict");

    let mut conn = provider.connection().expect("conn");
    assert!(!table_exists(&mut conn, &name), "physical table must be compensated away");
    conn.batch_execute(&format!("DELETE FROM _system_object WHERE api_name = '{name}'")).unwrap();
}

#[test]
fn orphan_column_is_adopted_and_preserved() {
    let Some((provider, manager)) = setup() else { return };
    let name = unique_name("sm_orphan");
    let def = object_with(&name, vec![FieldDef::new("name", "Name", FieldType::Text)]);
    manager.create_table_from_definition(&def).expect("create");

    // Columna física creada por fuera del motor (huérfana: sin metadatos).
    {
        let mut conn = provider.connection().expect("conn");
        conn.batch_execute(&format!("ALTER TABLE {name} ADD COLUMN legacy_code text")).expect("manual column");
    }
    let legacy = FieldDef::new("legacy_code", "Legacy Code", FieldType::Text);
    manager.add_column(&def, &legacy).expect("adopt orphan");

    let mut conn = provider.connection().expect("conn");
    // La columna sigue ahí y ahora tiene metadatos.
    conn.batch_execute(&format!("SELECT legacy_code FROM {name} LIMIT 1")).expect("column intact");
    {
        use crm_persistence::schema::_system_field::dsl as f;
        let count: i64 = f::_system_field.filter(f::object_api_name.eq(&name))
                                         .filter(f::api_name.eq("legacy_code"))
                                         .count()
                                         .get_result(&mut conn)
                                         .unwrap();
        assert_eq!(count, 1);
    }
    // Re-ejecución: columna y metadatos presentes ⇒ no-op.
    manager.add_column(&def, &legacy).expect("idempotent re-run");
    manager.drop_table(&name).expect("drop");
}

#[test]
fn ghost_column_skips_ddl_but_clears_metadata() {
    let Some((provider, manager)) = setup() else { return };
    let name = unique_name("sm_ghost");
    let def = object_with(&name,
                          vec![FieldDef::new("name", "Name", FieldType::Text),
                               FieldDef::new("phantom", "Phantom", FieldType::Text)]);
    manager.create_table_from_definition(&def).expect("create");

    // Borra la columna física por fuera: queda el metadato fantasma.
    {
        let mut conn = provider.connection().expect("conn");
        conn.batch_execute(&format!("ALTER TABLE {name} DROP COLUMN phantom")).expect("manual drop");
    }
    manager.drop_column(&def, "phantom").expect("ghost drop");

    let mut conn = provider.connection().expect("conn");
    use crm_persistence::schema::_system_field::dsl as f;
    let count: i64 = f::_system_field.filter(f::object_api_name.eq(&name))
                                     .filter(f::api_name.eq("phantom"))
                                     .count()
                                     .get_result(&mut conn)
                                     .unwrap();
    assert_eq!(count, 0, "ghost metadata must be removed");
    manager.drop_table(&name).expect("drop");
}

#[test]
fn registry_reports_missing_physical_tables() {
    let Some((provider, manager)) = setup() else { return };
    let name = unique_name("sm_drift");
    let def = object_with(&name, vec![FieldDef::new("name", "Name", FieldType::Text)]);
    manager.create_table_from_definition(&def).expect("create");
    {
        let mut conn = provider.connection().expect("conn");
        conn.batch_execute(&format!("DROP TABLE {name}")).expect("out-of-band drop");
    }
    let missing = manager.validate_schema_registry().expect("validate");
    assert!(missing.contains(&name));
    manager.drop_table(&name).expect("cleanup metadata");
}
