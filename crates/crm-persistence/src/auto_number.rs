//! Numeración automática: incremento atómico bajo lock de fila, dentro de la
//! transacción del insert que lo consume.

use diesel::prelude::*;
use log::debug;
use uuid::Uuid;

use crm_domain::{AutoNumberDef, EngineError};

use crate::error::PersistenceError;

/// Toma el siguiente número para (objeto, campo) y devuelve el valor ya
/// formateado. La fila de metadatos se lee con `FOR UPDATE`: dos inserts
/// concurrentes serializan aquí y nunca repiten número.
pub fn next_formatted(conn: &mut PgConnection, object: &str, field: &str) -> Result<String, EngineError> {
    use crate::schema::_system_auto_number::dsl as an;
    type Row = (Uuid, String, String, String, i64);
    let row: Row = an::_system_auto_number.filter(an::object_api_name.eq(object))
                                          .filter(an::field_api_name.eq(field))
                                          .for_update()
                                          .first(conn)
                                          .optional()
                                          .map_err(PersistenceError::from)?
                                          .ok_or_else(|| {
                                              EngineError::not_found("auto_number", format!("{object}.{field}"))
                                          })?;
    let (row_id, object_name, field_name, format, current) = row;
    let next = current + 1;
    diesel::update(an::_system_auto_number.filter(an::id.eq(row_id)))
        .set(an::current_number.eq(next))
        .execute(conn)
        .map_err(PersistenceError::from)?;
    let def = AutoNumberDef { object_api_name: object_name,
                              field_api_name: field_name,
                              display_format: format,
                              current_number: next };
    let formatted = def.format(next);
    debug!("auto_number: {object}.{field} -> {formatted}");
    Ok(formatted)
}
