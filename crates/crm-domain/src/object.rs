//! Definición lógica de objetos y campos de sistema.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::field::FieldDef;

/// Campos de sistema presentes en todo objeto de usuario. Son estampados por
/// el servidor y nunca editables por el cliente.
pub mod system_fields {
    pub const ID: &str = "id";
    pub const CREATED_DATE: &str = "created_date";
    pub const CREATED_BY_ID: &str = "created_by_id";
    pub const LAST_MODIFIED_DATE: &str = "last_modified_date";
    pub const LAST_MODIFIED_BY_ID: &str = "last_modified_by_id";
    pub const OWNER_ID: &str = "owner_id";
    pub const IS_DELETED: &str = "is_deleted";

    pub const ALL: [&str; 7] = [ID,
                                CREATED_DATE,
                                CREATED_BY_ID,
                                LAST_MODIFIED_DATE,
                                LAST_MODIFIED_BY_ID,
                                OWNER_ID,
                                IS_DELETED];

    pub fn is_system(name: &str) -> bool {
        ALL.iter().any(|s| s.eq_ignore_ascii_case(name))
    }
}

/// Modelo de compartición por defecto del objeto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingModel {
    Private,
    PublicReadOnly,
    PublicReadWrite,
}

impl SharingModel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Some(Self::Private),
            "publicreadonly" | "public_read_only" => Some(Self::PublicReadOnly),
            "publicreadwrite" | "public_read_write" => Some(Self::PublicReadWrite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "Private",
            Self::PublicReadOnly => "PublicReadOnly",
            Self::PublicReadWrite => "PublicReadWrite",
        }
    }
}

/// Entidad lógica del catálogo. Invariantes:
/// - `api_name` es único e inmutable (snake_case para objetos de usuario).
/// - Todo objeto tiene una tabla física homónima.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDef {
    pub api_name: String,
    pub label: String,
    pub plural_label: String,
    pub description: Option<String>,
    pub is_custom: bool,
    pub sharing_model: SharingModel,
    pub app_id: Option<Uuid>,
    pub table_type: Option<String>,
    pub list_fields: Vec<String>,
    pub icon: Option<String>,
    /// Campos del objeto, indexados por api_name en minúsculas (la grafía
    /// original vive dentro de cada `FieldDef`).
    pub fields: IndexMap<String, FieldDef>,
}

impl ObjectDef {
    pub fn field(&self, api_name: &str) -> Option<&FieldDef> {
        self.fields.get(&api_name.to_ascii_lowercase())
    }

    pub fn add_field(&mut self, field: FieldDef) {
        self.fields.insert(field.api_name.to_ascii_lowercase(), field);
    }

    pub fn name_field(&self) -> Option<&FieldDef> {
        self.fields.values().find(|f| f.is_name_field)
    }

    /// Lecturas de objetos públicos no requieren chequeo a nivel de registro.
    pub fn is_public_read(&self) -> bool {
        matches!(self.sharing_model, SharingModel::PublicReadOnly | SharingModel::PublicReadWrite)
    }

    pub fn master_detail_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values().filter(|f| f.is_master_detail)
    }
}
