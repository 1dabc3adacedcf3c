//! Auditoría de cambios y papelera de reciclaje.
//!
//! Las filas de auditoría se escriben dentro de la misma transacción que la
//! mutación: un fallo de auditoría aborta la transacción del usuario
//! (auditoría estricta).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crm_domain::EngineError;

use crate::error::PersistenceError;
use crate::schema::{_system_audit_log, _system_recycle_bin};

/// Cambio de un campo no-sistema, con valores old/new ya stringificados.
pub struct FieldChange {
    pub field_api_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub fn write_changes(conn: &mut PgConnection, object: &str, record_id: Uuid, changed_by: Uuid,
                     changes: &[FieldChange])
                     -> Result<(), EngineError> {
    use crate::schema::_system_audit_log::dsl as a;
    for change in changes {
        diesel::insert_into(_system_audit_log::table)
            .values((a::object_api_name.eq(object),
                     a::record_id.eq(record_id),
                     a::field_api_name.eq(&change.field_api_name),
                     a::old_value.eq(change.old_value.as_deref()),
                     a::new_value.eq(change.new_value.as_deref()),
                     a::changed_by_id.eq(changed_by),
                     a::changed_date.eq(Utc::now())))
            .execute(conn)
            .map_err(|e| EngineError::Fatal(format!("audit write failed: {}", PersistenceError::from(e))))?;
    }
    Ok(())
}

#[derive(Debug, Queryable)]
pub struct AuditRow {
    pub id: i64,
    pub object_api_name: String,
    pub record_id: Uuid,
    pub field_api_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by_id: Uuid,
    pub changed_date: DateTime<Utc>,
}

pub fn list_for_record(conn: &mut PgConnection, object: &str, record: Uuid) -> Result<Vec<AuditRow>, EngineError> {
    use crate::schema::_system_audit_log::dsl as a;
    a::_system_audit_log.filter(a::object_api_name.eq(object))
                        .filter(a::record_id.eq(record))
                        .order(a::changed_date.asc())
                        .load(conn)
                        .map_err(|e| PersistenceError::from(e).into())
}

/// Alta en papelera al soft-borrar. La clave es el record_id.
pub fn recycle_bin_insert(conn: &mut PgConnection, object: &str, record_id: Uuid, deleted_by: Uuid)
                          -> Result<(), EngineError> {
    use crate::schema::_system_recycle_bin::dsl as r;
    diesel::insert_into(_system_recycle_bin::table)
        .values((r::record_id.eq(record_id),
                 r::object_api_name.eq(object),
                 r::deleted_by_id.eq(deleted_by),
                 r::deleted_date.eq(Utc::now())))
        .on_conflict(r::record_id)
        .do_update()
        .set((r::deleted_by_id.eq(deleted_by), r::deleted_date.eq(Utc::now())))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

pub fn recycle_bin_remove(conn: &mut PgConnection, record_id: Uuid) -> Result<bool, EngineError> {
    use crate::schema::_system_recycle_bin::dsl as r;
    let n = diesel::delete(r::_system_recycle_bin.filter(r::record_id.eq(record_id)))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(n > 0)
}

pub fn recycle_bin_contains(conn: &mut PgConnection, record_id: Uuid) -> Result<bool, EngineError> {
    use crate::schema::_system_recycle_bin::dsl as r;
    diesel::select(diesel::dsl::exists(r::_system_recycle_bin.filter(r::record_id.eq(record_id))))
        .get_result(conn)
        .map_err(|e| PersistenceError::from(e).into())
}
