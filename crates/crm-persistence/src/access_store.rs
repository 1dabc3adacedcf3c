//! Consultas de acceso: permisos efectivos, roles, grupos, shares manuales y
//! miembros de equipo. Sólo lecturas; la decisión vive en el motor de
//! permisos.

use diesel::prelude::*;
use uuid::Uuid;

use crm_domain::{AccessLevel, EngineError, FieldPermFlags, ObjectPermFlags, RecordShare, TeamMember, UserContext};

use crate::error::PersistenceError;

/// Filas de permiso de objeto aplicables al usuario: las de su perfil más las
/// de todos sus permission sets. El OR efectivo lo hace el motor.
pub fn object_perm_rows(conn: &mut PgConnection, user: &UserContext, object: &str)
                        -> Result<Vec<ObjectPermFlags>, EngineError> {
    use crate::schema::_system_object_perms::dsl::*;
    let mut query = _system_object_perms.filter(object_api_name.eq(object)).into_boxed();
    query = match user.profile_id {
        Some(profile) => {
            query.filter(profile_id.eq(profile)
                                   .or(permission_set_id.eq_any(user.permission_set_ids.clone())))
        }
        None => query.filter(permission_set_id.eq_any(user.permission_set_ids.clone())),
    };
    type Row = (Uuid, Option<Uuid>, Option<Uuid>, String, bool, bool, bool, bool);
    let rows: Vec<Row> = query.load(conn).map_err(PersistenceError::from)?;
    Ok(rows.into_iter()
           .map(|(_, _, _, _, r, c, e, d)| ObjectPermFlags { can_read: r,
                                                             can_create: c,
                                                             can_edit: e,
                                                             can_delete: d })
           .collect())
}

pub fn field_perm_rows(conn: &mut PgConnection, user: &UserContext, object: &str, field: &str)
                       -> Result<Vec<FieldPermFlags>, EngineError> {
    use crate::schema::_system_field_perms::dsl::*;
    let mut query = _system_field_perms.filter(object_api_name.eq(object))
                                       .filter(field_api_name.eq(field))
                                       .into_boxed();
    query = match user.profile_id {
        Some(profile) => {
            query.filter(profile_id.eq(profile)
                                   .or(permission_set_id.eq_any(user.permission_set_ids.clone())))
        }
        None => query.filter(permission_set_id.eq_any(user.permission_set_ids.clone())),
    };
    type Row = (Uuid, Option<Uuid>, Option<Uuid>, String, String, bool, bool);
    let rows: Vec<Row> = query.load(conn).map_err(PersistenceError::from)?;
    Ok(rows.into_iter()
           .map(|(_, _, _, _, _, r, e)| FieldPermFlags { can_read: r,
                                                         can_edit: e })
           .collect())
}

/// Mapa completo role_id → parent_role_id para el cache de jerarquía.
pub fn role_parent_map(conn: &mut PgConnection) -> Result<std::collections::HashMap<Uuid, Option<Uuid>>, EngineError> {
    use crate::schema::_system_role::dsl::*;
    let rows: Vec<(Uuid, String, Option<Uuid>)> = _system_role.load(conn).map_err(PersistenceError::from)?;
    Ok(rows.into_iter().map(|(role_id, _, parent)| (role_id, parent)).collect())
}

pub fn is_group_member(conn: &mut PgConnection, group: Uuid, user: Uuid) -> Result<bool, EngineError> {
    use crate::schema::_system_group_member::dsl::*;
    diesel::select(diesel::dsl::exists(_system_group_member.filter(group_id.eq(group))
                                                           .filter(member_id.eq(user))))
        .get_result(conn)
        .map_err(|e| PersistenceError::from(e).into())
}

/// Grupos a los que pertenece el usuario (para shares hacia grupos).
pub fn groups_of(conn: &mut PgConnection, user: Uuid) -> Result<Vec<Uuid>, EngineError> {
    use crate::schema::_system_group_member::dsl::*;
    _system_group_member.filter(member_id.eq(user))
                        .select(group_id)
                        .load(conn)
                        .map_err(|e| PersistenceError::from(e).into())
}

pub fn record_shares(conn: &mut PgConnection, object: &str, record: Uuid) -> Result<Vec<RecordShare>, EngineError> {
    use crate::schema::_system_record_share::dsl::*;
    type Row = (Uuid, String, Uuid, Option<Uuid>, Option<Uuid>, String);
    let rows: Vec<Row> = _system_record_share.filter(object_api_name.eq(object))
                                             .filter(record_id.eq(record))
                                             .load(conn)
                                             .map_err(PersistenceError::from)?;
    Ok(rows.into_iter()
           .filter_map(|(share_id, obj, rec, user, group, level)| {
               AccessLevel::parse(&level).map(|access| RecordShare { id: share_id,
                                                                     object_api_name: obj,
                                                                     record_id: rec,
                                                                     user_id: user,
                                                                     group_id: group,
                                                                     access_level: access })
           })
           .collect())
}

pub fn team_members(conn: &mut PgConnection, object: &str, record: Uuid) -> Result<Vec<TeamMember>, EngineError> {
    use crate::schema::_system_team_member::dsl::*;
    type Row = (Uuid, String, Uuid, Uuid, String);
    let rows: Vec<Row> = _system_team_member.filter(object_api_name.eq(object))
                                            .filter(record_id.eq(record))
                                            .load(conn)
                                            .map_err(PersistenceError::from)?;
    Ok(rows.into_iter()
           .filter_map(|(member_id, obj, rec, user, level)| {
               AccessLevel::parse(&level).map(|access| TeamMember { id: member_id,
                                                                    object_api_name: obj,
                                                                    record_id: rec,
                                                                    user_id: user,
                                                                    access_level: access })
           })
           .collect())
}

/// Arma la sesión de un usuario: perfil (flag de admin), rol y permission
/// sets asignados.
pub fn load_user_context(conn: &mut PgConnection, user_id: Uuid) -> Result<UserContext, EngineError> {
    use crate::schema::_system_user::dsl as u;
    type UserRow = (Uuid, String, Option<String>, Option<Uuid>, Option<Uuid>, bool, chrono::DateTime<chrono::Utc>);
    let row: UserRow = u::_system_user.filter(u::id.eq(user_id))
                                      .first(conn)
                                      .optional()
                                      .map_err(PersistenceError::from)?
                                      .ok_or_else(|| EngineError::not_found("user", user_id))?;
    let (uid, username, _hash, profile, role, _active, _created) = row;

    let is_admin = match profile {
        Some(profile_uuid) => {
            use crate::schema::_system_profile::dsl as p;
            p::_system_profile.filter(p::id.eq(profile_uuid))
                              .select(p::is_admin)
                              .first::<bool>(conn)
                              .optional()
                              .map_err(PersistenceError::from)?
                              .unwrap_or(false)
        }
        None => false,
    };

    let permission_set_ids: Vec<Uuid> = {
        use crate::schema::_system_permission_set_assignment::dsl as a;
        a::_system_permission_set_assignment.filter(a::user_id.eq(uid))
                                            .select(a::permission_set_id)
                                            .load(conn)
                                            .map_err(PersistenceError::from)?
    };

    Ok(UserContext { id: uid,
                     username,
                     profile_id: profile,
                     permission_set_ids,
                     role_id: role,
                     is_system_admin: is_admin })
}
