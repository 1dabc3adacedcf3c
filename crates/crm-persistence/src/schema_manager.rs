//! Schema manager: mantiene consistentes las tablas físicas y las tablas de
//! metadatos.
//!
//! Propiedades que este módulo garantiza:
//! - `create_table_from_definition` es atómico hacia afuera: si el registro de
//!   metadatos falla, la tabla física recién creada se dropea (compensación).
//! - `add_column` es idempotente: una columna física sin metadatos (huérfana)
//!   se adopta insertando sólo metadatos, y ante un fallo de registro nunca se
//!   borra una columna que no creamos nosotros (no se destruye data de
//!   usuario como compensación).
//! - `drop_column` es simétrico: una columna fantasma (metadatos sin columna
//!   física) saltea el DDL pero igual remueve los metadatos.
//! - El DDL corre en una conexión dedicada con `session_replication_role =
//!   replica` para cortar ciclos de registro entre tablas que se referencian.
//!
//! Regla de nombres: tablas/columnas de usuario matchean
//! `^[a-z][a-z0-9_]*$`; el prefijo de sistema `_system_` queda exento.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Text;
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crm_core::catalog::Catalog;
use crm_core::formula::FormulaEngine;
use crm_domain::{system_fields, EngineError, FieldDef, FieldType, ObjectDef};

use crate::error::PersistenceError;
use crate::schema::{_system_auto_number, _system_field, _system_object, _system_table};
use crate::tx::{run_in_transaction, ConnectionProvider};

static USER_IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("ident regex"));

/// Valida un identificador SQL de usuario. Las tablas de sistema (prefijo
/// `_system_`) quedan exentas del chequeo snake_case.
pub fn ensure_user_ident(name: &str) -> Result<(), EngineError> {
    if name.starts_with("_system_") {
        return Ok(());
    }
    if USER_IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::validation(name, "identifier must match ^[a-z][a-z0-9_]*$"))
    }
}

fn sql_type_for(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Picklist | FieldType::AutoNumber => "text",
        FieldType::Number | FieldType::Currency | FieldType::Percent | FieldType::RollupSummary => "double precision",
        FieldType::Boolean => "boolean",
        FieldType::Date => "date",
        FieldType::DateTime => "timestamptz",
        FieldType::Lookup => "uuid",
        FieldType::Json => "jsonb",
        FieldType::Formula => "text", // el tipo real sale de return_type
    }
}

/// DDL de columnas para un campo (la segunda entrada es la columna
/// discriminadora de lookups polimórficos).
fn column_ddl(field: &FieldDef) -> Result<Vec<String>, EngineError> {
    ensure_user_ident(&field.api_name)?;
    field.validate_definition()?;
    let mut ddl = Vec::new();
    match field.field_type {
        FieldType::Formula => {
            let formula = field.formula.as_deref().unwrap_or_default();
            let expr = FormulaEngine::to_storage_sql(formula)?;
            let sql_type = sql_type_for(field.return_type.unwrap_or(FieldType::Text));
            ddl.push(format!("{} {} GENERATED ALWAYS AS ({}) STORED", field.api_name, sql_type, expr));
        }
        _ => {
            let mut col = format!("{} {}", field.api_name, sql_type_for(field.field_type));
            if field.unique {
                col.push_str(" UNIQUE");
            }
            if field.is_master_detail {
                col.push_str(" NOT NULL");
            }
            ddl.push(col);
        }
    }
    if field.is_polymorphic() {
        ddl.push(format!("{} text", field.type_column_name()));
    }
    Ok(ddl)
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(Insertable)]
#[diesel(table_name = _system_object)]
struct NewObjectRow<'a> {
    id: Uuid,
    api_name: &'a str,
    label: &'a str,
    plural_label: &'a str,
    description: Option<&'a str>,
    is_custom: bool,
    sharing_model: String,
    app_id: Option<Uuid>,
    table_type: Option<&'a str>,
    list_fields: Option<Value>,
    icon: Option<&'a str>,
    created_date: chrono::DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = _system_field)]
struct NewFieldRow {
    id: Uuid,
    object_api_name: String,
    api_name: String,
    label: String,
    field_type: String,
    required: bool,
    is_unique: bool,
    default_value: Option<Value>,
    help_text: Option<String>,
    is_system: bool,
    is_name_field: bool,
    options: Option<Value>,
    min_length: Option<i32>,
    max_length: Option<i32>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    regex: Option<String>,
    regex_message: Option<String>,
    reference_to: Option<Value>,
    is_master_detail: bool,
    delete_rule: Option<String>,
    relationship_name: Option<String>,
    formula: Option<String>,
    return_type: Option<String>,
    rollup_config: Option<Value>,
    validator: Option<String>,
    validator_config: Option<Value>,
}

impl NewFieldRow {
    fn from_def(object_api_name: &str, field: &FieldDef) -> Result<Self, EngineError> {
        let rollup_config = match field.rollup_config.as_ref() {
            Some(cfg) => Some(serde_json::to_value(cfg)
                .map_err(|e| EngineError::Internal(format!("rollup_config serialization: {e}")))?),
            None => None,
        };
        Ok(Self { id: Uuid::new_v4(),
                  object_api_name: object_api_name.to_string(),
                  api_name: field.api_name.clone(),
                  label: field.label.clone(),
                  field_type: field.field_type.as_str().to_string(),
                  required: field.required,
                  is_unique: field.unique,
                  default_value: field.default_value.clone(),
                  help_text: field.help_text.clone(),
                  is_system: field.is_system,
                  is_name_field: field.is_name_field,
                  options: if field.options.is_empty() {
                      None
                  } else {
                      Some(Value::from(field.options.clone()))
                  },
                  min_length: field.min_length.map(|v| v as i32),
                  max_length: field.max_length.map(|v| v as i32),
                  min_value: field.min_value,
                  max_value: field.max_value,
                  regex: field.regex.clone(),
                  regex_message: field.regex_message.clone(),
                  reference_to: if field.reference_to.is_empty() {
                      None
                  } else {
                      Some(Value::from(field.reference_to.clone()))
                  },
                  is_master_detail: field.is_master_detail,
                  delete_rule: field.delete_rule.map(|r| r.as_str().to_string()),
                  relationship_name: field.relationship_name.clone(),
                  formula: field.formula.clone(),
                  return_type: field.return_type.map(|t| t.as_str().to_string()),
                  rollup_config,
                  validator: field.validator.clone(),
                  validator_config: field.validator_config.clone() })
    }
}

pub struct SchemaManager {
    provider: Arc<dyn ConnectionProvider>,
    // Se engancha después de construir (el catálogo necesita un
    // MetadataSource ya armado); toda mutación de metadatos invalida.
    catalog: once_cell::sync::OnceCell<Arc<Catalog>>,
}

impl SchemaManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider,
               catalog: once_cell::sync::OnceCell::new() }
    }

    pub fn attach_catalog(&self, catalog: Arc<Catalog>) {
        let _ = self.catalog.set(catalog);
    }

    fn invalidate_catalog(&self) {
        if let Some(catalog) = self.catalog.get() {
            catalog.invalidate_cache();
        }
    }

    fn ddl_conn(&self) -> Result<crate::tx::PooledPgConnection, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        // Conexión dedicada a DDL: corta la validación de referencias para
        // poder registrar tablas con ciclos entre sí.
        conn.batch_execute("SET session_replication_role = replica;")
            .map_err(|e| EngineError::Fatal(format!("ddl session setup: {e}")))?;
        Ok(conn)
    }

    fn physical_table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, EngineError> {
        let rows: Vec<NameRow> = diesel::sql_query("SELECT table_name AS name FROM information_schema.tables \
                                                    WHERE table_schema = 'public' AND table_name = $1")
            .bind::<Text, _>(table)
            .load(conn)
            .map_err(PersistenceError::from)?;
        Ok(!rows.is_empty())
    }

    fn physical_column_exists(conn: &mut PgConnection, table: &str, column: &str) -> Result<bool, EngineError> {
        let rows: Vec<NameRow> = diesel::sql_query("SELECT column_name AS name FROM information_schema.columns \
                                                    WHERE table_schema = 'public' AND table_name = $1 \
                                                    AND column_name = $2")
            .bind::<Text, _>(table)
            .bind::<Text, _>(column)
            .load(conn)
            .map_err(PersistenceError::from)?;
        Ok(!rows.is_empty())
    }

    /// Emite el CREATE TABLE con columnas, índices y FKs inline. No toca
    /// metadatos.
    pub fn create_physical_table(&self, def: &ObjectDef) -> Result<(), EngineError> {
        let table = def.api_name.to_ascii_lowercase();
        ensure_user_ident(&table)?;
        let mut conn = self.ddl_conn()?;

        let mut columns: Vec<String> = vec!["id uuid PRIMARY KEY DEFAULT gen_random_uuid()".into(),
                                            "created_date timestamptz NOT NULL DEFAULT now()".into(),
                                            "created_by_id uuid".into(),
                                            "last_modified_date timestamptz NOT NULL DEFAULT now()".into(),
                                            "last_modified_by_id uuid".into(),
                                            "owner_id uuid".into(),
                                            "is_deleted boolean NOT NULL DEFAULT false".into()];
        for field in def.fields.values() {
            if system_fields::is_system(&field.api_name) {
                continue;
            }
            columns.extend(column_ddl(field)?);
        }
        let create = format!("CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)", columns.join(",\n    "));
        debug!("schema_manager: create table {table}");
        conn.batch_execute(&create)
            .map_err(|e| EngineError::Fatal(format!("create table {table}: {e}")))?;

        // Índices sobre lookups y FKs para lookups de destino único cuyo
        // destino ya existe físicamente.
        for field in def.fields.values() {
            if field.field_type != FieldType::Lookup {
                continue;
            }
            let col = &field.api_name;
            let idx = format!("CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table} ({col})");
            conn.batch_execute(&idx)
                .map_err(|e| EngineError::Fatal(format!("create index on {table}.{col}: {e}")))?;
            if !field.is_polymorphic() {
                let target = field.reference_to[0].to_ascii_lowercase();
                ensure_user_ident(&target)?;
                if Self::physical_table_exists(&mut conn, &target)? {
                    let fk = format!("ALTER TABLE {table} ADD CONSTRAINT fk_{table}_{col} \
                                      FOREIGN KEY ({col}) REFERENCES {target} (id)");
                    if let Err(e) = conn.batch_execute(&fk) {
                        // FK duplicada en re-ejecución idempotente: tolerada.
                        if !e.to_string().contains("already exists") {
                            return Err(EngineError::Fatal(format!("fk {table}.{col} -> {target}: {e}")));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn drop_physical_table(&self, table: &str) -> Result<(), EngineError> {
        ensure_user_ident(table)?;
        let mut conn = self.ddl_conn()?;
        conn.batch_execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .map_err(|e| EngineError::Fatal(format!("drop table {table}: {e}")))?;
        Ok(())
    }

    /// Inserta las filas de metadatos del objeto (registro de tabla, objeto,
    /// campos y numeraciones) en una única transacción.
    fn register_object_metadata(&self, conn: &mut PgConnection, def: &ObjectDef) -> Result<(), EngineError> {
        run_in_transaction(conn, |tx| {
            let table = def.api_name.to_ascii_lowercase();
            diesel::insert_into(_system_table::table)
                .values((_system_table::table_name.eq(&table),
                         _system_table::object_api_name.eq(&def.api_name),
                         _system_table::created_date.eq(Utc::now())))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            let row = NewObjectRow { id: Uuid::new_v4(),
                                     api_name: &def.api_name,
                                     label: &def.label,
                                     plural_label: &def.plural_label,
                                     description: def.description.as_deref(),
                                     is_custom: def.is_custom,
                                     sharing_model: def.sharing_model.as_str().to_string(),
                                     app_id: def.app_id,
                                     table_type: def.table_type.as_deref(),
                                     list_fields: if def.list_fields.is_empty() {
                                         None
                                     } else {
                                         Some(Value::from(def.list_fields.clone()))
                                     },
                                     icon: def.icon.as_deref(),
                                     created_date: Utc::now() };
            diesel::insert_into(_system_object::table).values(&row)
                                                      .execute(tx)
                                                      .map_err(PersistenceError::from)?;
            for field in def.fields.values() {
                diesel::insert_into(_system_field::table)
                    .values(&NewFieldRow::from_def(&def.api_name, field)?)
                    .execute(tx)
                    .map_err(PersistenceError::from)?;
                if field.field_type == FieldType::AutoNumber {
                    self.register_auto_number(tx, &def.api_name, field)?;
                }
            }
            Ok(())
        })
    }

    fn register_auto_number(&self, conn: &mut PgConnection, object: &str, field: &FieldDef)
                            -> Result<(), EngineError> {
        let format = field.default_value
                          .as_ref()
                          .and_then(Value::as_str)
                          .unwrap_or("{0000}")
                          .to_string();
        diesel::insert_into(_system_auto_number::table)
            .values((_system_auto_number::id.eq(Uuid::new_v4()),
                     _system_auto_number::object_api_name.eq(object),
                     _system_auto_number::field_api_name.eq(&field.api_name),
                     _system_auto_number::display_format.eq(format),
                     _system_auto_number::current_number.eq(0i64)))
            .execute(conn)
            .map_err(PersistenceError::from)?;
        Ok(())
    }

    /// Crea la tabla física y registra los metadatos. Si el registro falla,
    /// la tabla física se dropea como compensación: ni tabla ni metadatos
    /// sobreviven a un fallo.
    pub fn create_table_from_definition(&self, def: &ObjectDef) -> Result<(), EngineError> {
        self.create_physical_table(def)?;
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        if let Err(e) = self.register_object_metadata(&mut conn, def) {
            error!("schema_manager: metadata registration for {} failed, dropping table: {e}",
                   def.api_name);
            if let Err(drop_err) = self.drop_physical_table(&def.api_name.to_ascii_lowercase()) {
                error!("schema_manager: compensating drop of {} also failed: {drop_err}", def.api_name);
            }
            return Err(e);
        }
        self.invalidate_catalog();
        Ok(())
    }

    /// Agrega una columna de manera idempotente (ver contrato del módulo).
    pub fn add_column(&self, object: &ObjectDef, field: &FieldDef) -> Result<(), EngineError> {
        let table = object.api_name.to_ascii_lowercase();
        ensure_user_ident(&table)?;
        ensure_user_ident(&field.api_name)?;
        field.validate_definition()?;

        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        let physically_present = Self::physical_column_exists(&mut conn, &table, &field.api_name)?;
        let in_metadata: bool = {
            use crate::schema::_system_field::dsl;
            diesel::select(diesel::dsl::exists(
                dsl::_system_field.filter(dsl::object_api_name.eq(&object.api_name))
                                  .filter(dsl::api_name.eq(&field.api_name)),
            )).get_result(&mut conn)
              .map_err(PersistenceError::from)?
        };
        if physically_present && in_metadata {
            debug!("add_column {}.{}: already present, no-op", table, field.api_name);
            return Ok(());
        }

        let mut created_here = false;
        if !physically_present {
            let mut ddl_conn = self.ddl_conn()?;
            for col in column_ddl(field)? {
                let alter = format!("ALTER TABLE {table} ADD COLUMN {col}");
                if let Err(e) = ddl_conn.batch_execute(&alter) {
                    // Rollback del ALTER parcial (p.ej. la discriminadora
                    // falló tras crear la columna principal).
                    let _ = ddl_conn.batch_execute(&format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {}",
                                                            field.api_name));
                    return Err(EngineError::Fatal(format!("add column {table}.{}: {e}", field.api_name)));
                }
            }
            created_here = true;
            // FK opcional de lookups de destino único; si falla se revierte
            // la columna recién creada.
            if field.field_type == FieldType::Lookup && !field.is_polymorphic() {
                let target = field.reference_to[0].to_ascii_lowercase();
                ensure_user_ident(&target)?;
                if Self::physical_table_exists(&mut conn, &target)? {
                    let fk = format!("ALTER TABLE {table} ADD CONSTRAINT fk_{table}_{} \
                                      FOREIGN KEY ({}) REFERENCES {target} (id)",
                                     field.api_name, field.api_name);
                    if let Err(e) = ddl_conn.batch_execute(&fk) {
                        warn!("add_column: fk creation failed, rolling back column: {e}");
                        let _ = ddl_conn.batch_execute(&format!("ALTER TABLE {table} DROP COLUMN {}",
                                                                field.api_name));
                        return Err(EngineError::Fatal(format!("fk for {table}.{}: {e}", field.api_name)));
                    }
                }
            }
        } else if !in_metadata {
            debug!("add_column {}.{}: adopting orphan physical column", table, field.api_name);
        }

        let registration = run_in_transaction(&mut conn, |tx| {
            diesel::insert_into(_system_field::table)
                .values(&NewFieldRow::from_def(&object.api_name, field)?)
                .execute(tx)
                .map_err(PersistenceError::from)?;
            if field.field_type == FieldType::AutoNumber {
                self.register_auto_number(tx, &object.api_name, field)?;
            }
            Ok(())
        });
        if let Err(e) = registration {
            if created_here {
                let mut ddl_conn = self.ddl_conn()?;
                let _ = ddl_conn.batch_execute(&format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {}",
                                                        field.api_name));
            }
            // Columna adoptada: se preserva. Nunca borramos data de usuario
            // como compensación de un fallo de metadatos.
            return Err(e);
        }
        self.invalidate_catalog();
        Ok(())
    }

    /// Elimina una columna; una columna fantasma (sin presencia física)
    /// saltea el DDL pero remueve los metadatos igual.
    pub fn drop_column(&self, object: &ObjectDef, field_api_name: &str) -> Result<(), EngineError> {
        let table = object.api_name.to_ascii_lowercase();
        ensure_user_ident(&table)?;
        ensure_user_ident(field_api_name)?;
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        if Self::physical_column_exists(&mut conn, &table, field_api_name)? {
            let mut ddl_conn = self.ddl_conn()?;
            ddl_conn.batch_execute(&format!("ALTER TABLE {table} DROP COLUMN {field_api_name}"))
                    .map_err(|e| EngineError::Fatal(format!("drop column {table}.{field_api_name}: {e}")))?;
            let type_col = format!("{field_api_name}_type");
            let _ = ddl_conn.batch_execute(&format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {type_col}"));
        } else {
            debug!("drop_column {table}.{field_api_name}: ghost column, skipping DDL");
        }
        run_in_transaction(&mut conn, |tx| {
            use crate::schema::_system_field::dsl;
            diesel::delete(dsl::_system_field.filter(dsl::object_api_name.eq(&object.api_name))
                                             .filter(dsl::api_name.eq(field_api_name)))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            use crate::schema::_system_auto_number::dsl as an;
            diesel::delete(an::_system_auto_number.filter(an::object_api_name.eq(&object.api_name))
                                                  .filter(an::field_api_name.eq(field_api_name)))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            Ok(())
        })?;
        self.invalidate_catalog();
        Ok(())
    }

    /// Drop completo en cascada: tabla física, registro de tabla, metadatos
    /// de campos, fila de objeto y numeraciones.
    pub fn drop_table(&self, object_api_name: &str) -> Result<(), EngineError> {
        let table = object_api_name.to_ascii_lowercase();
        self.drop_physical_table(&table)?;
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        run_in_transaction(&mut conn, |tx| {
            use crate::schema::_system_table::dsl as t;
            diesel::delete(t::_system_table.filter(t::table_name.eq(&table))).execute(tx)
                                                                             .map_err(PersistenceError::from)?;
            use crate::schema::_system_field::dsl as f;
            diesel::delete(f::_system_field.filter(f::object_api_name.eq(object_api_name)))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            use crate::schema::_system_object::dsl as o;
            diesel::delete(o::_system_object.filter(o::api_name.eq(object_api_name)))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            use crate::schema::_system_auto_number::dsl as an;
            diesel::delete(an::_system_auto_number.filter(an::object_api_name.eq(object_api_name)))
                .execute(tx)
                .map_err(PersistenceError::from)?;
            Ok(())
        })?;
        self.invalidate_catalog();
        Ok(())
    }

    /// Crea las tablas físicas de todas las definiciones en paralelo, acotado
    /// a 10 workers. Ante cualquier fallo, dropea todas las creadas.
    pub fn batch_create_physical_tables(&self, defs: &[ObjectDef]) -> Result<(), EngineError> {
        const MAX_WORKERS: usize = 10;
        let next = AtomicUsize::new(0);
        let created: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let first_error: Mutex<Option<EngineError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..MAX_WORKERS.min(defs.len()) {
                scope.spawn(|| {
                    loop {
                        if first_error.lock().map(|g| g.is_some()).unwrap_or(true) {
                            return;
                        }
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(def) = defs.get(idx) else { return };
                        match self.create_physical_table(def) {
                            Ok(()) => {
                                if let Ok(mut c) = created.lock() {
                                    c.push(def.api_name.to_ascii_lowercase());
                                }
                            }
                            Err(e) => {
                                if let Ok(mut slot) = first_error.lock() {
                                    slot.get_or_insert(e);
                                }
                                return;
                            }
                        }
                    }
                });
            }
        });

        let error = first_error.into_inner().unwrap_or(None);
        if let Some(e) = error {
            let tables = created.into_inner().unwrap_or_default();
            warn!("batch create failed, compensating drop of {} tables", tables.len());
            for table in tables {
                if let Err(drop_err) = self.drop_physical_table(&table) {
                    error!("compensating drop of {table} failed: {drop_err}");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reporta tablas registradas en metadatos pero ausentes en
    /// `information_schema` (drift físico).
    pub fn validate_schema_registry(&self) -> Result<Vec<String>, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        use crate::schema::_system_table::dsl as t;
        let registered: Vec<String> = t::_system_table.select(t::table_name)
                                                      .load(&mut conn)
                                                      .map_err(PersistenceError::from)?;
        let mut missing = Vec::new();
        for table in registered {
            if !Self::physical_table_exists(&mut conn, &table)? {
                missing.push(table);
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ident_rule() {
        assert!(ensure_user_ident("invoice").is_ok());
        assert!(ensure_user_ident("line_item2").is_ok());
        assert!(ensure_user_ident("_system_outbox_event").is_ok());
        assert!(ensure_user_ident("Invoice").is_err());
        assert!(ensure_user_ident("1table").is_err());
        assert!(ensure_user_ident("bad-name").is_err());
        assert!(ensure_user_ident("drop table x").is_err());
    }

    #[test]
    fn formula_fields_become_generated_columns() {
        let mut f = FieldDef::new("display_len", "Display Len", FieldType::Formula);
        f.formula = Some("LEN(name)".into());
        f.return_type = Some(FieldType::Number);
        let ddl = column_ddl(&f).unwrap();
        assert_eq!(ddl, vec!["display_len double precision GENERATED ALWAYS AS (char_length(name)) STORED"]);
    }

    #[test]
    fn polymorphic_lookup_emits_discriminator_column() {
        let mut f = FieldDef::new("related_to", "Related To", FieldType::Lookup);
        f.reference_to = vec!["ticket".into(), "account".into()];
        let ddl = column_ddl(&f).unwrap();
        assert_eq!(ddl.len(), 2);
        assert_eq!(ddl[0], "related_to uuid");
        assert_eq!(ddl[1], "related_to_type text");
    }
}
