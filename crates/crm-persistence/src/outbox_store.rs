//! Outbox transaccional: persistencia atómica de eventos y claim concurrente
//! para el worker de publicación.
//!
//! Garantías:
//! - `enqueue` dentro de la transacción de negocio: el evento se persiste si
//!   y sólo si el write commitea (at-least-once hacia abajo).
//! - `claim` usa `FOR UPDATE SKIP LOCKED`: dos workers nunca procesan el
//!   mismo evento a la vez; un claim vacío significa que otro worker lo tomó.
//! - `record_failure` incrementa retry_count y pasa a Failed al alcanzar el
//!   máximo; un evento Failed no se reintenta nunca más.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Uuid as SqlUuid;
use log::debug;
use serde_json::Value;
use uuid::Uuid;

use crm_domain::{EngineError, OutboxStatus};

use crate::error::PersistenceError;
use crate::schema::_system_outbox_event;

#[derive(Debug, Clone, Queryable)]
pub struct OutboxRow {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub status: String,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_date: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
}

#[derive(QueryableByName)]
struct ClaimRow {
    #[diesel(sql_type = SqlUuid)]
    #[allow(dead_code)]
    id: Uuid,
}

/// Inserta el evento como pending dentro de la transacción del llamador (si
/// la conexión no está en transacción, el insert es atómico por sí mismo).
pub fn enqueue(conn: &mut PgConnection, event_type: &str, payload: &Value) -> Result<Uuid, EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    let event_id = Uuid::new_v4();
    diesel::insert_into(_system_outbox_event::table)
        .values((o::id.eq(event_id),
                 o::event_type.eq(event_type),
                 o::payload.eq(payload),
                 o::status.eq(OutboxStatus::Pending.as_str()),
                 o::retry_count.eq(0),
                 o::created_date.eq(Utc::now())))
        .execute(conn)
        .map_err(|e| match PersistenceError::from(e) {
            // Un enqueue fallido debe abortar la transacción de negocio.
            PersistenceError::SerializationConflict => EngineError::Transient("outbox enqueue conflict".into()),
            other => EngineError::Fatal(format!("outbox enqueue failed: {other}")),
        })?;
    debug!("outbox: enqueued {event_type} as {event_id}");
    Ok(event_id)
}

/// Lote de pendientes más antiguos, lectura sin lock.
pub fn fetch_pending(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxRow>, EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    o::_system_outbox_event.filter(o::status.eq(OutboxStatus::Pending.as_str()))
                           .order(o::created_date.asc())
                           .limit(limit)
                           .load(conn)
                           .map_err(|e| PersistenceError::from(e).into())
}

/// Intenta reclamar el evento dentro de la transacción actual. `false` ⇒ otro
/// worker lo tiene (o ya no está pending).
pub fn claim(conn: &mut PgConnection, event_id: Uuid) -> Result<bool, EngineError> {
    let rows: Vec<ClaimRow> = diesel::sql_query("SELECT id FROM _system_outbox_event \
                                                 WHERE id = $1 AND status = 'pending' FOR UPDATE SKIP LOCKED")
        .bind::<SqlUuid, _>(event_id)
        .load(conn)
        .map_err(PersistenceError::from)?;
    Ok(!rows.is_empty())
}

pub fn mark_processed(conn: &mut PgConnection, event_id: Uuid) -> Result<(), EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    diesel::update(o::_system_outbox_event.filter(o::id.eq(event_id)))
        .set((o::status.eq(OutboxStatus::Processed.as_str()), o::processed_date.eq(Some(Utc::now()))))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

/// Marca el evento directamente como Failed (payload indecodificable).
pub fn mark_failed(conn: &mut PgConnection, event_id: Uuid, error: &str) -> Result<(), EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    diesel::update(o::_system_outbox_event.filter(o::id.eq(event_id)))
        .set((o::status.eq(OutboxStatus::Failed.as_str()), o::error_message.eq(Some(error))))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(())
}

/// Registra un fallo de publicación: retry_count += 1 y error; al alcanzar
/// `max_retries` el evento pasa a Failed y queda fuera del ciclo.
pub fn record_failure(conn: &mut PgConnection, event: &OutboxRow, error: &str, max_retries: i32)
                      -> Result<OutboxStatus, EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    let next_count = event.retry_count + 1;
    let next_status = if next_count >= max_retries {
        OutboxStatus::Failed
    } else {
        OutboxStatus::Pending
    };
    diesel::update(o::_system_outbox_event.filter(o::id.eq(event.id)))
        .set((o::status.eq(next_status.as_str()),
              o::retry_count.eq(next_count),
              o::error_message.eq(Some(error))))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(next_status)
}

/// Limpieza de procesados fuera de la ventana de retención.
pub fn cleanup_processed(conn: &mut PgConnection, older_than: DateTime<Utc>) -> Result<usize, EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    let n = diesel::delete(o::_system_outbox_event.filter(o::status.eq(OutboxStatus::Processed.as_str()))
                                                  .filter(o::processed_date.lt(Some(older_than))))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(n)
}

pub fn get(conn: &mut PgConnection, event_id: Uuid) -> Result<Option<OutboxRow>, EngineError> {
    use crate::schema::_system_outbox_event::dsl as o;
    o::_system_outbox_event.filter(o::id.eq(event_id))
                           .first(conn)
                           .optional()
                           .map_err(|e| PersistenceError::from(e).into())
}
