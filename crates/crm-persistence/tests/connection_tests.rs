//! Pruebas básicas de configuración y pool (requieren DATABASE_URL válido en
//! el entorno).

use crm_persistence::{config::DbConfig, tx::build_pool};

#[test]
fn create_pool_from_env() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return;
    }
    let cfg = DbConfig::from_env();
    let pool = build_pool(&cfg.url, cfg.min_connections, cfg.max_connections).expect("pool");
    let mut conn = pool.get().expect("conn");
    use diesel::connection::SimpleConnection;
    conn.batch_execute("SELECT 1;").expect("select 1");
}

#[test]
fn migrations_create_system_tables() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return;
    }
    let cfg = DbConfig::from_env();
    let pool = build_pool(&cfg.url, 1, 4).expect("pool");
    let mut conn = pool.get().expect("conn");
    use diesel::connection::SimpleConnection;
    for table in ["_system_object", "_system_field", "_system_flow", "_system_outbox_event", "_system_recycle_bin"] {
        conn.batch_execute(&format!("SELECT 1 FROM {table} LIMIT 1;"))
            .unwrap_or_else(|e| panic!("tabla {table} ausente: {e}"));
    }
}
