//! Motor de persistencia: el envelope transaccional de CRUD sobre objetos
//! dirigidos por metadatos.
//!
//! Orden del write-path (todo dentro de una transacción con retry):
//! lock (update/delete) → lookups polimórficos → normalización → estampado de
//! campos de sistema / numeración automática → validación → unicidad →
//! evento before (sincrónico, los handlers pueden mutar) → write físico →
//! auditoría → rollups (registro nuevo y viejo) → enqueue del evento after en
//! el outbox. El evento after se publica recién después del commit, desde el
//! worker.
//!
//! Borrado: soft-delete con papelera de reciclaje y reglas de cascada
//! (Cascade / SetNull / Restrict) sobre los hijos; `restore` y `purge`
//! deshacen o materializan el borrado.

use std::sync::Arc;

use chrono::Utc;
use diesel::PgConnection;
use log::{debug, warn};
use uuid::Uuid;

use crm_core::catalog::Catalog;
use crm_core::validator::Validator;
use crm_domain::{system_fields, DeleteRule, EngineError, FieldType, FieldValue, ObjectDef, Operation, RecordEvent,
                 RecordEventKind, SObject, UserContext};
use crm_persistence::tx::{with_tx_retry, ConnectionProvider};
use crm_persistence::{audit, auto_number, outbox_store, record_repo};

use crate::bus::EventBus;
use crate::normalize::{apply_defaults, normalize_input};
use crate::permissions::PermissionEngine;
use crate::rollups::RollupEngine;

pub struct RecordService {
    provider: Arc<dyn ConnectionProvider>,
    catalog: Arc<Catalog>,
    validator: Arc<Validator>,
    permissions: Arc<PermissionEngine>,
    rollups: Arc<RollupEngine>,
    bus: Arc<EventBus>,
}

impl RecordService {
    pub fn new(provider: Arc<dyn ConnectionProvider>, catalog: Arc<Catalog>, validator: Arc<Validator>,
               permissions: Arc<PermissionEngine>, rollups: Arc<RollupEngine>, bus: Arc<EventBus>)
               -> Self {
        Self { provider,
               catalog,
               validator,
               permissions,
               rollups,
               bus }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    fn schema_of(&self, object_api_name: &str) -> Result<ObjectDef, EngineError> {
        self.catalog
            .get_schema(object_api_name)?
            .ok_or_else(|| EngineError::not_found("object", object_api_name))
    }

    /// Chequeo de objeto previo a la transacción (deny rápido).
    fn fast_object_check(&self, user: &UserContext, object: &str, op: Operation) -> Result<(), EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        self.permissions.ensure_object_access(&mut conn, user, object, op)
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    pub fn insert(&self, user: &UserContext, object_api_name: &str, input: SObject) -> Result<SObject, EngineError> {
        let object = self.schema_of(object_api_name)?;
        self.fast_object_check(user, &object.api_name, Operation::Create)?;
        with_tx_retry(self.provider.as_ref(), |conn| self.insert_in_tx(conn, user, &object, input.clone()))
    }

    /// Variante que se suma a la transacción del llamador (acciones de flujo).
    pub fn insert_in_tx(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef, input: SObject)
                        -> Result<SObject, EngineError> {
        let mut record = normalize_input(object, &input)?;
        apply_defaults(object, &mut record);
        self.resolve_polymorphic(conn, object, &mut record)?;

        // Campos de sistema: el id puede venir dado (import), el resto se
        // estampa siempre del lado del servidor.
        let id = input.get_uuid(system_fields::ID).unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        record.set(system_fields::ID, id);
        record.set(system_fields::CREATED_DATE, now);
        record.set(system_fields::CREATED_BY_ID, user.id);
        record.set(system_fields::LAST_MODIFIED_DATE, now);
        record.set(system_fields::LAST_MODIFIED_BY_ID, user.id);
        let owner = input.get_uuid(system_fields::OWNER_ID).unwrap_or(user.id);
        record.set(system_fields::OWNER_ID, owner);
        record.set(system_fields::IS_DELETED, false);

        // Numeración automática bajo lock de la fila de metadatos.
        for field in object.fields.values() {
            if field.field_type == FieldType::AutoNumber {
                let value = auto_number::next_formatted(conn, &object.api_name, &field.api_name)?;
                record.set(field.api_name.clone(), value);
            }
        }

        let rules = self.catalog.get_validation_rules(&object.api_name)?;
        self.validator.validate_record(&record, object, &rules, None, Some(user))?;
        self.check_uniqueness(conn, object, &record, None)?;

        // Evento before: los handlers pueden mutar el registro (p.ej. hashear
        // una credencial) antes del write.
        let mut event = RecordEvent::new(RecordEventKind::BeforeCreate, &object.api_name, record, None, user.clone());
        self.bus.publish(conn, &mut event)?;
        let record = event.record;

        record_repo::insert(conn, object, &record)?;
        self.rollups.process_rollups(conn, &object.api_name, &record)?;
        self.enqueue_after(conn, RecordEventKind::AfterCreate, object, record.clone(), None, user)?;
        debug!("records: inserted {} {}", object.api_name, id);
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    pub fn update(&self, user: &UserContext, object_api_name: &str, id: Uuid, fields: SObject)
                  -> Result<SObject, EngineError> {
        let object = self.schema_of(object_api_name)?;
        self.fast_object_check(user, &object.api_name, Operation::Edit)?;
        with_tx_retry(self.provider.as_ref(), |conn| self.update_in_tx(conn, user, &object, id, fields.clone()))
    }

    pub fn update_in_tx(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef, id: Uuid,
                        fields: SObject)
                        -> Result<SObject, EngineError> {
        let old = self.lock_live_row(conn, object, id)?;
        self.permissions.ensure_record_access(conn, user, object, &old, Operation::Edit)?;

        let mut incoming = normalize_input(object, &fields)?;
        self.resolve_polymorphic(conn, object, &mut incoming)?;

        // Diff contra la fila actual: campos sin cambio y campos que el
        // usuario no puede editar se saltean.
        let mut changes = SObject::new();
        for (key, value) in incoming.iter() {
            let unchanged = old.get(key).map(|o| o.to_json() == value.to_json()).unwrap_or(false);
            if unchanged {
                continue;
            }
            if !self.permissions.field_editable(conn, user, &object.api_name, key)? {
                debug!("records: skipping non-editable field '{}' on {}", key, object.api_name);
                continue;
            }
            changes.set(key.clone(), value.clone());
        }

        // Candidato = fila actual + cambios, para validación y hooks.
        let mut candidate = old.clone();
        for (k, v) in changes.iter() {
            candidate.set(k.clone(), v.clone());
        }
        let rules = self.catalog.get_validation_rules(&object.api_name)?;
        self.validator.validate_record(&candidate, object, &rules, Some(&old), Some(user))?;
        self.check_uniqueness(conn, object, &changes, Some(id))?;

        let mut event = RecordEvent::new(RecordEventKind::BeforeUpdate,
                                         &object.api_name,
                                         candidate,
                                         Some(old.clone()),
                                         user.clone());
        self.bus.publish(conn, &mut event)?;
        let candidate = event.record;

        // Re-diff: los handlers del before pueden haber mutado el candidato.
        // Los virtuales no se escriben; las claves fuera de esquema que
        // sobreviven son las discriminadoras `<campo>_type` (el repo descarta
        // cualquier otra).
        let mut changes = SObject::new();
        for (key, value) in candidate.iter() {
            if system_fields::is_system(key) {
                continue;
            }
            if object.field(key).map(|f| f.is_virtual()).unwrap_or(false) {
                continue;
            }
            let unchanged = old.get(key).map(|o| o.to_json() == value.to_json()).unwrap_or(false);
            if !unchanged {
                changes.set(key.clone(), value.clone());
            }
        }
        if changes.is_empty() {
            debug!("records: update of {} {} had no effective changes", object.api_name, id);
            return Ok(old);
        }

        let now = Utc::now();
        changes.set(system_fields::LAST_MODIFIED_DATE, now);
        changes.set(system_fields::LAST_MODIFIED_BY_ID, user.id);

        record_repo::update(conn, object, id, &changes)?;

        // Auditoría estricta: una fila por campo no-sistema cambiado, dentro
        // de la misma transacción.
        let audit_changes: Vec<audit::FieldChange> =
            changes.iter()
                   .filter(|(k, _)| !system_fields::is_system(k) && object.field(k).is_some())
                   .map(|(k, v)| audit::FieldChange { field_api_name: k.clone(),
                                                      old_value: old.get(k)
                                                                    .filter(|o| !o.is_null())
                                                                    .map(FieldValue::to_display_string),
                                                      new_value: if v.is_null() {
                                                          None
                                                      } else {
                                                          Some(v.to_display_string())
                                                      } })
                   .collect();
        audit::write_changes(conn, &object.api_name, id, user.id, &audit_changes)?;

        let mut updated = old.clone();
        for (k, v) in changes.iter() {
            updated.set(k.clone(), v.clone());
        }
        // Rollups del registro nuevo y del viejo: un re-parenting debe dejar
        // consistentes a ambos padres.
        self.rollups.process_rollups(conn, &object.api_name, &updated)?;
        self.rollups.process_rollups(conn, &object.api_name, &old)?;

        self.enqueue_after(conn, RecordEventKind::AfterUpdate, object, updated.clone(), Some(old), user)?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Delete / Restore / Purge
    // -----------------------------------------------------------------------

    pub fn delete(&self, user: &UserContext, object_api_name: &str, id: Uuid) -> Result<(), EngineError> {
        let object = self.schema_of(object_api_name)?;
        self.fast_object_check(user, &object.api_name, Operation::Delete)?;
        with_tx_retry(self.provider.as_ref(), |conn| self.delete_in_tx(conn, user, &object, id, false))
    }

    pub fn delete_in_tx(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef, id: Uuid,
                        cascading: bool)
                        -> Result<(), EngineError> {
        let old = self.lock_live_row(conn, object, id)?;
        if !cascading {
            self.permissions.ensure_record_access(conn, user, object, &old, Operation::Delete)?;
        }

        let mut event =
            RecordEvent::new(RecordEventKind::BeforeDelete, &object.api_name, old.clone(), None, user.clone());
        self.bus.publish(conn, &mut event)?;

        self.apply_delete_rules(conn, user, object, id)?;

        let mut tombstone = SObject::new();
        tombstone.set(system_fields::IS_DELETED, true);
        tombstone.set(system_fields::LAST_MODIFIED_DATE, Utc::now());
        tombstone.set(system_fields::LAST_MODIFIED_BY_ID, user.id);
        record_repo::update(conn, object, id, &tombstone)?;
        audit::recycle_bin_insert(conn, &object.api_name, id, user.id)?;

        // El hijo dejó de contar para sus padres.
        self.rollups.process_rollups(conn, &object.api_name, &old)?;

        self.enqueue_after(conn, RecordEventKind::AfterDelete, object, old, None, user)?;
        debug!("records: soft-deleted {} {}", object.api_name, id);
        Ok(())
    }

    /// Aplica las reglas de borrado sobre los hijos que referencian a `id`:
    /// Master-Detail siempre cascadea; Restrict aborta si hay hijos vivos;
    /// SetNull (default de lookups) desengancha.
    fn apply_delete_rules(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef, id: Uuid)
                          -> Result<(), EngineError> {
        let snapshot = self.catalog.snapshot()?;
        for child in snapshot.objects.values() {
            for field in child.fields.values() {
                if field.field_type != FieldType::Lookup {
                    continue;
                }
                let references_us = field.reference_to.iter().any(|t| t.eq_ignore_ascii_case(&object.api_name));
                if !references_us {
                    continue;
                }
                let children = record_repo::child_ids(conn, child, &field.api_name, id)?;
                if children.is_empty() {
                    continue;
                }
                let rule = if field.is_master_detail {
                    DeleteRule::Cascade
                } else {
                    field.delete_rule.unwrap_or(DeleteRule::SetNull)
                };
                match rule {
                    DeleteRule::Restrict => {
                        return Err(EngineError::Conflict(format!("cannot delete {}: {} {} record(s) reference it",
                                                                 object.api_name,
                                                                 children.len(),
                                                                 child.api_name)));
                    }
                    DeleteRule::Cascade => {
                        for child_id in children {
                            self.delete_in_tx(conn, user, child, child_id, true)?;
                        }
                    }
                    DeleteRule::SetNull => {
                        record_repo::null_out_references(conn, child, &field.api_name, id)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Saca el registro de la papelera: is_deleted vuelve a false y se
    /// publica `updated`.
    pub fn restore(&self, user: &UserContext, object_api_name: &str, id: Uuid) -> Result<SObject, EngineError> {
        let object = self.schema_of(object_api_name)?;
        self.fast_object_check(user, &object.api_name, Operation::Edit)?;
        with_tx_retry(self.provider.as_ref(), |conn| {
            let row = record_repo::get_lock(conn, &object, id)?
                .ok_or_else(|| EngineError::not_found(&object.api_name, id))?;
            if !row.get(system_fields::IS_DELETED).and_then(FieldValue::as_bool).unwrap_or(false) {
                return Err(EngineError::Conflict(format!("{} {id} is not in the recycle bin", object.api_name)));
            }
            self.permissions.ensure_record_access(conn, user, &object, &row, Operation::Edit)?;

            let mut patch = SObject::new();
            patch.set(system_fields::IS_DELETED, false);
            patch.set(system_fields::LAST_MODIFIED_DATE, Utc::now());
            patch.set(system_fields::LAST_MODIFIED_BY_ID, user.id);
            record_repo::update(conn, &object, id, &patch)?;
            audit::recycle_bin_remove(conn, id)?;

            let mut restored = row.clone();
            restored.set(system_fields::IS_DELETED, false);
            self.rollups.process_rollups(conn, &object.api_name, &restored)?;
            self.enqueue_after(conn, RecordEventKind::AfterUpdate, &object, restored.clone(), Some(row), user)?;
            Ok(restored)
        })
    }

    /// Borrado físico de un registro ya en papelera; publica `deleted`.
    pub fn purge(&self, user: &UserContext, object_api_name: &str, id: Uuid) -> Result<(), EngineError> {
        let object = self.schema_of(object_api_name)?;
        self.fast_object_check(user, &object.api_name, Operation::Delete)?;
        with_tx_retry(self.provider.as_ref(), |conn| {
            let row = record_repo::get_lock(conn, &object, id)?
                .ok_or_else(|| EngineError::not_found(&object.api_name, id))?;
            if !row.get(system_fields::IS_DELETED).and_then(FieldValue::as_bool).unwrap_or(false) {
                return Err(EngineError::Conflict(format!("{} {id} must be soft-deleted before purge",
                                                         object.api_name)));
            }
            // Hijos master-detail ya soft-borrados por la cascada: se
            // materializa su borrado físico.
            let snapshot = self.catalog.snapshot()?;
            for child in snapshot.objects.values() {
                for field in child.fields.values() {
                    if field.is_master_detail
                       && field.reference_to.iter().any(|t| t.eq_ignore_ascii_case(&object.api_name))
                    {
                        record_repo::delete_by_field(conn, child, &field.api_name, &id.to_string())?;
                    }
                }
            }
            record_repo::physical_delete(conn, &object, id)?;
            audit::recycle_bin_remove(conn, id)?;
            self.enqueue_after(conn, RecordEventKind::AfterDelete, &object, row, None, user)?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    pub fn get(&self, user: &UserContext, object_api_name: &str, id: Uuid) -> Result<SObject, EngineError> {
        let object = self.schema_of(object_api_name)?;
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        self.permissions.ensure_object_access(&mut conn, user, &object.api_name, Operation::Read)?;
        let record = record_repo::get(&mut conn, &object, id)?
            .filter(|r| !r.get(system_fields::IS_DELETED).and_then(FieldValue::as_bool).unwrap_or(false))
            .ok_or_else(|| EngineError::not_found(&object.api_name, id))?;
        self.permissions.ensure_record_access(&mut conn, user, &object, &record, Operation::Read)?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lock_live_row(&self, conn: &mut PgConnection, object: &ObjectDef, id: Uuid) -> Result<SObject, EngineError> {
        let row = record_repo::get_lock(conn, object, id)?
            .ok_or_else(|| EngineError::not_found(&object.api_name, id))?;
        if row.get(system_fields::IS_DELETED).and_then(FieldValue::as_bool).unwrap_or(false) {
            return Err(EngineError::not_found(&object.api_name, id));
        }
        Ok(row)
    }

    /// Para cada lookup polimórfico con valor, el id referenciado debe
    /// existir en alguna de sus tablas destino; el tipo descubierto se
    /// escribe en la columna `<campo>_type`.
    fn resolve_polymorphic(&self, conn: &mut PgConnection, object: &ObjectDef, record: &mut SObject)
                           -> Result<(), EngineError> {
        let snapshot = self.catalog.snapshot()?;
        let poly_fields: Vec<_> = object.fields.values().filter(|f| f.is_polymorphic()).cloned().collect();
        for field in poly_fields {
            let Some(value) = record.get(&field.api_name) else { continue };
            if value.is_null() {
                record.set(field.type_column_name(), FieldValue::Null);
                continue;
            }
            let target_id = value.as_uuid()
                                 .ok_or_else(|| EngineError::validation(&field.api_name, "expected a record id"))?;
            let mut resolved = None;
            for target in &field.reference_to {
                let Some(target_object) = snapshot.object(target) else { continue };
                if record_repo::exists(conn, &target_object.api_name.to_ascii_lowercase(), target_id)? {
                    resolved = Some(target_object.api_name.clone());
                    break;
                }
            }
            match resolved {
                Some(object_type) => record.set(field.type_column_name(), object_type),
                None => {
                    return Err(EngineError::validation(&field.api_name,
                                                       format!("referenced id {target_id} not found in any of: {}",
                                                               field.reference_to.join(", "))));
                }
            }
        }
        Ok(())
    }

    /// Unicidad a nivel de motor para campos marcados unique (además del
    /// índice físico, que cubre la carrera).
    fn check_uniqueness(&self, conn: &mut PgConnection, object: &ObjectDef, record: &SObject, self_id: Option<Uuid>)
                        -> Result<(), EngineError> {
        for field in object.fields.values() {
            if !field.unique || field.is_system {
                continue;
            }
            let Some(value) = record.get(&field.api_name) else { continue };
            if value.is_null() {
                continue;
            }
            if let Some(existing) = record_repo::find_one_by(conn, object, &field.api_name,
                                                             &value.to_display_string())?
            {
                if existing.id() != self_id {
                    return Err(EngineError::Conflict(format!("{}.{} must be unique, value '{}' already exists",
                                                             object.api_name,
                                                             field.api_name,
                                                             value.to_display_string())));
                }
            }
        }
        Ok(())
    }

    /// Encola el evento after en el outbox, dentro de la transacción de
    /// negocio. Un fallo acá es fatal y aborta el write.
    fn enqueue_after(&self, conn: &mut PgConnection, kind: RecordEventKind, object: &ObjectDef, record: SObject,
                     old: Option<SObject>, user: &UserContext)
                     -> Result<(), EngineError> {
        let event = RecordEvent::new(kind, &object.api_name, record, old, user.clone());
        let payload = serde_json::to_value(&event)
            .map_err(|e| EngineError::Fatal(format!("event payload serialization: {e}")))?;
        outbox_store::enqueue(conn, kind.event_type(), &payload)?;
        Ok(())
    }

    /// Limpieza de outbox procesado fuera de retención (job de mantenimiento).
    pub fn cleanup_outbox(&self, older_than: chrono::DateTime<Utc>) -> Result<usize, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        let removed = outbox_store::cleanup_processed(&mut conn, older_than)?;
        if removed > 0 {
            warn!("outbox cleanup removed {removed} processed events");
        }
        Ok(removed)
    }
}
