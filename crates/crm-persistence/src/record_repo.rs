//! Repositorio genérico de filas sobre tablas de objetos de usuario.
//!
//! La forma de estas tablas es dinámica (la define el catálogo), por lo que
//! todo el I/O va por `sql_query` con identificadores validados:
//! - Lectura: `SELECT to_jsonb(t.*)` y deserialización a `SObject`.
//! - Escritura: un único bind jsonb con casts por columna derivados del tipo
//!   de campo (`(src.r->>'col')::timestamptz`, etc.).
//!
//! Toda operación recibe `&mut PgConnection`: dentro de una transacción
//! abierta se suma a ella; fuera, ejecuta standalone.

use diesel::prelude::*;
use diesel::sql_types::{Bool, Jsonb, Text, Uuid as SqlUuid};
use serde_json::Value;
use uuid::Uuid;

use crm_domain::{system_fields, EngineError, FieldType, ObjectDef, SObject};

use crate::error::PersistenceError;
use crate::schema_manager::ensure_user_ident;

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    obj: Value,
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

#[derive(QueryableByName)]
struct PresentRow {
    #[diesel(sql_type = Bool)]
    present: bool,
}

/// Cast SQL del valor jsonb para una columna tipada. `None` ⇒ la columna es
/// jsonb y el valor se copia sin cast (`src.r->'col'`).
fn cast_for_type(field_type: FieldType) -> Option<&'static str> {
    match field_type {
        FieldType::Text | FieldType::Picklist | FieldType::AutoNumber => Some("text"),
        FieldType::Number | FieldType::Currency | FieldType::Percent => Some("double precision"),
        FieldType::Boolean => Some("boolean"),
        FieldType::Date => Some("date"),
        FieldType::DateTime => Some("timestamptz"),
        FieldType::Lookup => Some("uuid"),
        FieldType::Json => None,
        // Virtuales: nunca se escriben por esta vía.
        FieldType::Formula | FieldType::RollupSummary => Some("text"),
    }
}

fn system_cast(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "id" | "created_by_id" | "last_modified_by_id" | "owner_id" => Some("uuid"),
        "created_date" | "last_modified_date" => Some("timestamptz"),
        "is_deleted" => Some("boolean"),
        _ => None,
    }
}

/// Resuelve la columna física y su cast para una clave del registro. Claves
/// desconocidas o virtuales devuelven `None` y se descartan de la escritura.
fn column_for_key(object: &ObjectDef, key: &str) -> Option<(String, Option<&'static str>)> {
    if system_fields::is_system(key) {
        return Some((key.to_ascii_lowercase(), system_cast(key)));
    }
    if let Some(field) = object.field(key) {
        if field.is_virtual() {
            return None;
        }
        return Some((field.api_name.clone(), cast_for_type(field.field_type)));
    }
    // Columna discriminadora de un lookup polimórfico (`<campo>_type`).
    if let Some(base) = key.to_ascii_lowercase().strip_suffix("_type") {
        if object.field(base).map(|f| f.is_polymorphic()).unwrap_or(false) {
            return Some((key.to_ascii_lowercase(), Some("text")));
        }
    }
    None
}

fn table_of(object: &ObjectDef) -> Result<String, EngineError> {
    let table = object.api_name.to_ascii_lowercase();
    ensure_user_ident(&table)?;
    Ok(table)
}

/// Extrae las columnas escribibles del registro junto con el payload jsonb
/// keyed por nombre de columna física.
fn writable_columns(object: &ObjectDef, record: &SObject) -> (Vec<(String, Option<&'static str>)>, Value) {
    let mut columns = Vec::new();
    let mut payload = serde_json::Map::new();
    for (key, value) in record.iter() {
        if let Some((column, cast)) = column_for_key(object, key) {
            payload.insert(column.clone(), value.to_json());
            columns.push((column, cast));
        }
    }
    (columns, Value::Object(payload))
}

fn value_expr(column: &str, cast: Option<&'static str>) -> String {
    match cast {
        Some(cast) => format!("(src.r->>'{column}')::{cast}"),
        None => format!("src.r->'{column}'"),
    }
}

/// Inserta la fila. El registro debe venir normalizado (claves = api_name del
/// esquema, id y campos de sistema estampados).
pub fn insert(conn: &mut PgConnection, object: &ObjectDef, record: &SObject) -> Result<(), EngineError> {
    let table = table_of(object)?;
    let (columns, payload) = writable_columns(object, record);
    if columns.is_empty() {
        return Err(EngineError::Internal("insert with no writable columns".into()));
    }
    for (c, _) in &columns {
        ensure_user_ident(c)?;
    }
    let col_list: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
    let exprs: Vec<String> = columns.iter().map(|(c, cast)| value_expr(c, *cast)).collect();
    let sql = format!("INSERT INTO {table} ({}) SELECT {} FROM (SELECT $1::jsonb AS r) AS src",
                      col_list.join(", "),
                      exprs.join(", "));
    diesel::sql_query(sql).bind::<Jsonb, _>(&payload)
                          .execute(conn)
                          .map_err(PersistenceError::from)?;
    Ok(())
}

/// Actualiza las columnas presentes en `fields` para la fila `id`.
pub fn update(conn: &mut PgConnection, object: &ObjectDef, id: Uuid, fields: &SObject) -> Result<(), EngineError> {
    let table = table_of(object)?;
    let (columns, payload) = writable_columns(object, fields);
    if columns.is_empty() {
        return Ok(());
    }
    let sets: Vec<String> = columns.iter()
                                   .map(|(c, cast)| format!("{c} = {}", value_expr(c, *cast)))
                                   .collect();
    let sql = format!("UPDATE {table} SET {} FROM (SELECT $1::jsonb AS r) AS src WHERE {table}.id = $2",
                      sets.join(", "));
    let affected = diesel::sql_query(sql).bind::<Jsonb, _>(&payload)
                                         .bind::<SqlUuid, _>(id)
                                         .execute(conn)
                                         .map_err(PersistenceError::from)?;
    if affected == 0 {
        return Err(EngineError::not_found(&object.api_name, id));
    }
    Ok(())
}

fn fetch(conn: &mut PgConnection, object: &ObjectDef, id: Uuid, lock: bool) -> Result<Option<SObject>, EngineError> {
    let table = table_of(object)?;
    let suffix = if lock { " FOR UPDATE OF t" } else { "" };
    let sql = format!("SELECT to_jsonb(t.*) AS obj FROM {table} AS t WHERE t.id = $1{suffix}");
    let rows: Vec<JsonRow> = diesel::sql_query(sql).bind::<SqlUuid, _>(id)
                                                   .load(conn)
                                                   .map_err(PersistenceError::from)?;
    rows.into_iter().next().map(|r| SObject::from_json(&r.obj)).transpose()
}

pub fn get(conn: &mut PgConnection, object: &ObjectDef, id: Uuid) -> Result<Option<SObject>, EngineError> {
    fetch(conn, object, id, false)
}

/// Lee la fila con lock de escritura (`FOR UPDATE`). Base del envelope de
/// update/delete: lock → chequeo de acceso → mutación.
pub fn get_lock(conn: &mut PgConnection, object: &ObjectDef, id: Uuid) -> Result<Option<SObject>, EngineError> {
    fetch(conn, object, id, true)
}

pub fn exists(conn: &mut PgConnection, table: &str, id: Uuid) -> Result<bool, EngineError> {
    ensure_user_ident(table)?;
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1) AS present");
    let row: PresentRow = diesel::sql_query(sql).bind::<SqlUuid, _>(id)
                                                .get_result(conn)
                                                .map_err(PersistenceError::from)?;
    Ok(row.present)
}

pub fn physical_delete(conn: &mut PgConnection, object: &ObjectDef, id: Uuid) -> Result<(), EngineError> {
    let table = table_of(object)?;
    diesel::sql_query(format!("DELETE FROM {table} WHERE id = $1")).bind::<SqlUuid, _>(id)
                                                                   .execute(conn)
                                                                   .map_err(PersistenceError::from)?;
    Ok(())
}

/// Borra todas las filas cuyo `column` iguale el valor dado (comparación
/// textual). Usado por purges en cascada.
pub fn delete_by_field(conn: &mut PgConnection, object: &ObjectDef, column: &str, value: &str)
                       -> Result<usize, EngineError> {
    let table = table_of(object)?;
    ensure_user_ident(column)?;
    let n = diesel::sql_query(format!("DELETE FROM {table} WHERE {column}::text = $1"))
        .bind::<Text, _>(value)
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(n)
}

/// Primera fila viva cuyo `column` iguala el valor (comparación textual).
/// Base del chequeo de unicidad.
pub fn find_one_by(conn: &mut PgConnection, object: &ObjectDef, column: &str, value: &str)
                   -> Result<Option<SObject>, EngineError> {
    let table = table_of(object)?;
    ensure_user_ident(column)?;
    let sql = format!("SELECT to_jsonb(t.*) AS obj FROM {table} AS t \
                       WHERE t.{column}::text = $1 AND t.is_deleted = false LIMIT 1");
    let rows: Vec<JsonRow> = diesel::sql_query(sql).bind::<Text, _>(value)
                                                   .load(conn)
                                                   .map_err(PersistenceError::from)?;
    rows.into_iter().next().map(|r| SObject::from_json(&r.obj)).transpose()
}

/// Ids de filas vivas que referencian `parent_id` a través de `column`.
/// Enumeración de hijos para las reglas de borrado.
pub fn child_ids(conn: &mut PgConnection, object: &ObjectDef, column: &str, parent_id: Uuid)
                 -> Result<Vec<Uuid>, EngineError> {
    let table = table_of(object)?;
    ensure_user_ident(column)?;
    let sql = format!("SELECT id FROM {table} WHERE {column} = $1 AND is_deleted = false");
    let rows: Vec<IdRow> = diesel::sql_query(sql).bind::<SqlUuid, _>(parent_id)
                                                 .load(conn)
                                                 .map_err(PersistenceError::from)?;
    Ok(rows.into_iter().map(|r| r.id).collect())
}

/// Pone en NULL la referencia de todos los hijos (regla SetNull).
pub fn null_out_references(conn: &mut PgConnection, object: &ObjectDef, column: &str, parent_id: Uuid)
                           -> Result<usize, EngineError> {
    let table = table_of(object)?;
    ensure_user_ident(column)?;
    let n = diesel::sql_query(format!("UPDATE {table} SET {column} = NULL WHERE {column} = $1"))
        .bind::<SqlUuid, _>(parent_id)
        .execute(conn)
        .map_err(PersistenceError::from)?;
    Ok(n)
}
