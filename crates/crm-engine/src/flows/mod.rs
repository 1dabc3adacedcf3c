//! Automatización por flujos: ejecutor disparado por eventos, servicio de
//! acciones y máquina de instancias multistep con aprobaciones.

pub mod actions;
pub mod executor;
pub mod instances;

pub use actions::{ActionCtx, ActionService};
pub use executor::FlowExecutor;
pub use instances::FlowInstanceManager;
