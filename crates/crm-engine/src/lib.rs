//! crm-engine: orquestación del motor de registros.
//!
//! Acá viven las piezas que combinan lógica del core con storage:
//! - `bus`: pub/sub in-process de eventos de ciclo de vida (los handlers ven
//!   la transacción abierta).
//! - `permissions`: decisión completa de acceso (admin → objeto → registro →
//!   campo) consultando el storage.
//! - `records`: el envelope de CRUD (permisos → validación → hooks → write →
//!   auditoría → rollups → outbox, todo en una transacción con retry).
//! - `rollups`: recompute de agregados padre dentro de la transacción del
//!   hijo.
//! - `flows`: ejecutor de flujos, instancias multistep, aprobaciones y
//!   servicio de acciones.
//! - `outbox_worker` / `scheduler`: workers de background con stop
//!   idempotente.
//! - `builder`: cableado del grafo de servicios (los ciclos se cierran con
//!   inyección set-after-construction sobre traits estrechos).

pub mod builder;
pub mod bus;
pub mod flows;
pub mod normalize;
pub mod outbox_worker;
pub mod permissions;
pub mod records;
pub mod rollups;
pub mod scheduler;

pub use builder::{Engine, EngineBuilder};
pub use bus::{EventBus, EventHandler};
pub use flows::{ActionService, FlowExecutor, FlowInstanceManager};
pub use outbox_worker::OutboxWorker;
pub use permissions::PermissionEngine;
pub use records::RecordService;
pub use rollups::RollupEngine;
pub use scheduler::Scheduler;
