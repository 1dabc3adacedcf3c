//! Modelo de acceso: permisos efectivos de objeto/campo, roles jerárquicos,
//! reglas de compartición y shares manuales.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operación de negocio sometida a chequeo de permisos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Create,
    Edit,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Flags de permiso a nivel de objeto. El permiso efectivo de un usuario es el
/// OR bit a bit de todas las filas aplicables (perfil + permission sets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPermFlags {
    pub can_read: bool,
    pub can_create: bool,
    pub can_edit: bool,
    pub can_delete: bool,
}

impl ObjectPermFlags {
    pub fn all() -> Self {
        Self { can_read: true,
               can_create: true,
               can_edit: true,
               can_delete: true }
    }

    pub fn or_with(self, other: Self) -> Self {
        Self { can_read: self.can_read || other.can_read,
               can_create: self.can_create || other.can_create,
               can_edit: self.can_edit || other.can_edit,
               can_delete: self.can_delete || other.can_delete }
    }

    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.can_read,
            Operation::Create => self.can_create,
            Operation::Edit => self.can_edit,
            Operation::Delete => self.can_delete,
        }
    }
}

/// Flags de permiso a nivel de campo. Si no existe fila para el campo, se cae
/// al permiso de objeto.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPermFlags {
    pub can_read: bool,
    pub can_edit: bool,
}

impl FieldPermFlags {
    pub fn or_with(self, other: Self) -> Self {
        Self { can_read: self.can_read || other.can_read,
               can_edit: self.can_edit || other.can_edit }
    }
}

/// Rol en el árbol jerárquico. Los ancestros se computan caminando
/// `parent_role_id` con guardia de ciclos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub parent_role_id: Option<Uuid>,
}

/// Nivel de acceso concedido por una regla de compartición o share manual.
/// `Edit` subsume lectura.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    Read,
    Edit,
}

impl AccessLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Edit => "Edit",
        }
    }

    /// Edit ⇒ read+edit; Read ⇒ sólo read. Delete nunca se concede por share.
    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Read => true,
            Operation::Edit => *self == Self::Edit,
            Operation::Create | Operation::Delete => false,
        }
    }
}

/// Regla declarativa de compartición: criterio (fórmula sobre el registro) +
/// destino (rol, usuario o grupo) + nivel de acceso.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingRule {
    pub id: Uuid,
    pub object_api_name: String,
    pub criteria: Option<String>,
    pub access_level: AccessLevel,
    pub share_with_role_id: Option<Uuid>,
    pub share_with_user_id: Option<Uuid>,
    pub share_with_group_id: Option<Uuid>,
}

/// Share manual de un registro concreto hacia un usuario o grupo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordShare {
    pub id: Uuid,
    pub object_api_name: String,
    pub record_id: Uuid,
    pub user_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub access_level: AccessLevel,
}

/// Miembro de equipo de un registro, con su nivel de acceso propio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Uuid,
    pub object_api_name: String,
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub member_id: Uuid,
}

/// Sesión de usuario vista por el motor. `is_system_admin` cortocircuita todo
/// chequeo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub id: Uuid,
    pub username: String,
    pub profile_id: Option<Uuid>,
    pub permission_set_ids: Vec<Uuid>,
    pub role_id: Option<Uuid>,
    pub is_system_admin: bool,
}

impl UserContext {
    /// Sesión sintética de sistema usada por el scheduler y los workers.
    pub fn system() -> Self {
        Self { id: Uuid::nil(),
               username: "system".into(),
               profile_id: None,
               permission_set_ids: Vec::new(),
               role_id: None,
               is_system_admin: true }
    }
}
