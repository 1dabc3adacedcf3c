//! crm-domain: modelo de metadatos y registros dinámicos
//!
//! Propósito:
//! - Definir las entidades del catálogo (objetos, campos, flujos, reglas,
//!   permisos) como datos serializables, sin ninguna dependencia de storage.
//! - Proveer el modelo de registro dinámico `SObject` (mapa api_name → valor)
//!   con su suma etiquetada `FieldValue` y conversiones JSON/storage.
//! - Exponer la taxonomía de errores de negocio (`EngineError`) compartida por
//!   todas las capas.
//!
//! Componentes principales:
//! - `object` / `field`: definiciones lógicas y sus invariantes.
//! - `value`: `FieldValue` + `SObject` (acceso case-insensitive).
//! - `flow`: flujos, pasos, instancias y work items de aprobación.
//! - `permission`: roles, permisos efectivos, reglas de compartición.
//! - `validation`: reglas de validación declarativas.
//! - `events`: eventos de ciclo de vida de registros y estados del outbox.
//! - `errors`: errores semánticos con clasificación de reintentos.

pub mod errors;
pub mod events;
pub mod field;
pub mod flow;
pub mod object;
pub mod permission;
pub mod validation;
pub mod value;

pub use errors::EngineError;
pub use events::{OutboxStatus, RecordEvent, RecordEventKind};
pub use field::{AutoNumberDef, DeleteRule, FieldDef, FieldType, RollupConfig, RollupFunction};
pub use flow::{ApprovalStatus, ApprovalWorkItem, FlowDef, FlowInstanceState, FlowStatus, FlowStepDef, FlowType,
               InstanceStatus, StepType, TriggerType};
pub use object::{system_fields, ObjectDef, SharingModel};
pub use permission::{AccessLevel, FieldPermFlags, Group, GroupMember, ObjectPermFlags, Operation, RecordShare, Role,
                     SharingRule, TeamMember, UserContext};
pub use validation::ValidationRuleDef;
pub use value::{FieldValue, SObject};
