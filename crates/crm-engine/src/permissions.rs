//! Motor de permisos: decisión completa de acceso.
//!
//! Orden de decisión para una operación sobre un registro:
//! 1. System Admin ⇒ permitir.
//! 2. Permiso efectivo de objeto (OR de perfil + permission sets). Sin fila o
//!    sin el flag de la operación ⇒ denegar.
//! 3. Nivel de registro (mutaciones siempre; lecturas sólo en objetos no
//!    public-read): dueño directo, dueño-grupo con membresía, ancestro
//!    estricto de rol (sólo lectura), reglas de compartición cuyo criterio
//!    matchea, shares manuales y miembros de equipo con nivel suficiente.
//! 4. Visibilidad/edición de campo: la fila de permiso de campo gana; sin
//!    fila se cae al permiso de objeto. Los campos de sistema nunca son
//!    editables por el cliente.

use std::collections::HashSet;
use std::sync::Arc;

use diesel::PgConnection;
use log::debug;
use uuid::Uuid;

use crm_core::catalog::Catalog;
use crm_core::permission::{effective_field_flags, effective_object_flags, sharing_rule_matches, RoleHierarchy};
use crm_domain::{system_fields, EngineError, ObjectDef, Operation, SObject, SharingModel, UserContext};
use crm_persistence::access_store;

pub struct PermissionEngine {
    catalog: Arc<Catalog>,
    roles: Arc<RoleHierarchy>,
}

impl PermissionEngine {
    pub fn new(catalog: Arc<Catalog>, roles: Arc<RoleHierarchy>) -> Self {
        Self { catalog, roles }
    }

    pub fn role_hierarchy(&self) -> &RoleHierarchy {
        &self.roles
    }

    /// Recarga el cache de jerarquía de roles desde el storage.
    pub fn refresh_role_hierarchy(&self, conn: &mut PgConnection) -> Result<(), EngineError> {
        let map = access_store::role_parent_map(conn)?;
        self.roles.replace(map);
        Ok(())
    }

    /// Chequeo de objeto (paso 1 y 2). Deniega rápido antes de abrir la
    /// transacción de negocio.
    pub fn ensure_object_access(&self, conn: &mut PgConnection, user: &UserContext, object: &str, op: Operation)
                                -> Result<(), EngineError> {
        if user.is_system_admin {
            return Ok(());
        }
        let rows = access_store::object_perm_rows(conn, user, object)?;
        let allowed = effective_object_flags(&rows).map(|f| f.allows(op)).unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            debug!("permission: object deny {} {} for {}", op.as_str(), object, user.username);
            Err(EngineError::permission(op.as_str(), object))
        }
    }

    fn owner_role(&self, conn: &mut PgConnection, owner_id: Uuid) -> Result<Option<Uuid>, EngineError> {
        match access_store::load_user_context(conn, owner_id) {
            Ok(owner) => Ok(owner.role_id),
            Err(EngineError::NotFound { .. }) => Ok(None), // el dueño puede ser un grupo
            Err(e) => Err(e),
        }
    }

    /// Chequeo a nivel de registro (paso 3). Asume que el chequeo de objeto
    /// ya pasó.
    pub fn ensure_record_access(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef,
                                record: &SObject, op: Operation)
                                -> Result<(), EngineError> {
        if user.is_system_admin {
            return Ok(());
        }
        // Modelo de compartición del objeto.
        match object.sharing_model {
            SharingModel::PublicReadWrite => return Ok(()),
            SharingModel::PublicReadOnly if op == Operation::Read => return Ok(()),
            _ => {}
        }

        let deny = || EngineError::permission(op.as_str(), format!("{} record", object.api_name));
        let Some(record_id) = record.id() else { return Err(deny()) };

        // a. dueño directo.
        if let Some(owner) = record.get_uuid(system_fields::OWNER_ID) {
            if owner == user.id {
                return Ok(());
            }
            // b. dueño grupo con membresía.
            if access_store::is_group_member(conn, owner, user.id)? {
                return Ok(());
            }
            // c. jerarquía de roles: los managers leen hacia abajo, nunca
            // escriben por jerarquía.
            if op == Operation::Read {
                if let (Some(user_role), Some(owner_role)) = (user.role_id, self.owner_role(conn, owner)?) {
                    if self.roles.is_strict_ancestor(user_role, owner_role) {
                        return Ok(());
                    }
                }
            }
        }

        // d. reglas de compartición declarativas.
        let rules = self.catalog.get_sharing_rules(&object.api_name)?;
        if !rules.is_empty() {
            let user_groups: HashSet<Uuid> = access_store::groups_of(conn, user.id)?.into_iter().collect();
            for rule in &rules {
                if !rule.access_level.allows(op) || !sharing_rule_matches(rule, record) {
                    continue;
                }
                let target_hit = rule.share_with_user_id == Some(user.id)
                                 || (rule.share_with_role_id.is_some() && rule.share_with_role_id == user.role_id)
                                 || rule.share_with_group_id
                                        .map(|g| user_groups.contains(&g))
                                        .unwrap_or(false);
                if target_hit {
                    return Ok(());
                }
            }
        }

        // e. shares manuales y miembros de equipo.
        for share in access_store::record_shares(conn, &object.api_name, record_id)? {
            if !share.access_level.allows(op) {
                continue;
            }
            let hit = share.user_id == Some(user.id)
                      || share.group_id
                              .map(|g| access_store::is_group_member(conn, g, user.id).unwrap_or(false))
                              .unwrap_or(false);
            if hit {
                return Ok(());
            }
        }
        for member in access_store::team_members(conn, &object.api_name, record_id)? {
            if member.user_id == user.id && member.access_level.allows(op) {
                return Ok(());
            }
        }

        Err(deny())
    }

    fn field_flags(&self, conn: &mut PgConnection, user: &UserContext, object: &str, field: &str)
                   -> Result<(bool, bool), EngineError> {
        if user.is_system_admin {
            return Ok((true, true));
        }
        let field_rows = access_store::field_perm_rows(conn, user, object, field)?;
        if let Some(flags) = effective_field_flags(&field_rows) {
            return Ok((flags.can_read, flags.can_edit));
        }
        // Sin fila de campo: fallback al permiso de objeto.
        let object_rows = access_store::object_perm_rows(conn, user, object)?;
        let flags = effective_object_flags(&object_rows).unwrap_or_default();
        Ok((flags.can_read, flags.can_edit))
    }

    pub fn field_visible(&self, conn: &mut PgConnection, user: &UserContext, object: &str, field: &str)
                         -> Result<bool, EngineError> {
        Ok(self.field_flags(conn, user, object, field)?.0)
    }

    /// Editabilidad de campo; los campos de sistema sólo los estampa el
    /// servidor.
    pub fn field_editable(&self, conn: &mut PgConnection, user: &UserContext, object: &str, field: &str)
                          -> Result<bool, EngineError> {
        if system_fields::is_system(field) {
            return Ok(false);
        }
        Ok(self.field_flags(conn, user, object, field)?.1)
    }

    /// Conjunto (lowercase) de campos no visibles del objeto para el usuario.
    /// Precomputado para los callbacks de visibilidad de fórmulas.
    pub fn hidden_fields(&self, conn: &mut PgConnection, user: &UserContext, object: &ObjectDef)
                         -> Result<HashSet<String>, EngineError> {
        let mut hidden = HashSet::new();
        if user.is_system_admin {
            return Ok(hidden);
        }
        for field in object.fields.values() {
            if !self.field_visible(conn, user, &object.api_name, &field.api_name)? {
                hidden.insert(field.api_name.to_ascii_lowercase());
            }
        }
        Ok(hidden)
    }
}
