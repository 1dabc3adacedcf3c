//! crm-core: lógica neutral del motor de registros dirigido por metadatos
//!
//! Propósito:
//! - Proveer los contratos y la lógica pura que no dependen del storage:
//!   catálogo en memoria, validación, fórmulas, decisiones de permiso,
//!   reescritura de SQL analítico, planeamiento de rollups, máquina de estados
//!   de instancias de flujo y matemática de schedules cron.
//! - Todo acceso a datos queda detrás de traits estrechos (`MetadataSource`,
//!   `WebhookClient`, `EmailSender`, `CredentialHasher`) que las capas de
//!   persistencia/adaptadores implementan.
//!
//! Componentes principales:
//! - `catalog`: snapshot atómico de metadatos con refresh perezoso.
//! - `formula`: evaluador de expresiones sobre registros + reescritura a SQL
//!   de storage para columnas generadas.
//! - `validator`: restricciones estáticas de campo + reglas declarativas.
//! - `permission`: mitad pura del motor de permisos (OR efectivo, jerarquía de
//!   roles con guardia de ciclos, niveles de acceso).
//! - `security`: validador/reescritor de SELECTs analíticos (filtro de owner).
//! - `rollup`: enumeración y SQL de agregados padre ← hijos, con denylist.
//! - `flow`: transiciones de instancia y cálculo de próximos runs.
//! - `actions`: modelo de configuración de acciones y traits de salida.

pub mod actions;
pub mod catalog;
pub mod flow;
pub mod formula;
pub mod permission;
pub mod rollup;
pub mod security;
pub mod validator;

pub use actions::{ActionType, CredentialHasher, EmailMessage, EmailSender, WebhookClient, WebhookRequest};
pub use catalog::{Catalog, CatalogSnapshot, MetadataSource};
pub use formula::{FormulaContext, FormulaEngine};
pub use permission::RoleHierarchy;
pub use rollup::RollupPlan;
pub use security::SecurityValidator;
pub use validator::Validator;
