//! Event bus in-process para eventos de ciclo de vida de registros.
//!
//! Publicación sincrónica en el task del publicador: los handlers de eventos
//! `Before*` corren dentro de la transacción de negocio y pueden mutar el
//! registro candidato; los `After*` llegan acá recién desde el worker del
//! outbox, después del commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use diesel::PgConnection;
use log::debug;

use crm_domain::{EngineError, RecordEvent, RecordEventKind};

pub trait EventHandler: Send + Sync {
    fn handle(&self, conn: &mut PgConnection, event: &mut RecordEvent) -> Result<(), EngineError>;
}

/// Registro de handlers por tipo de evento, protegido por mutex. La
/// publicación clona la lista bajo el lock y ejecuta fuera de él (un handler
/// puede publicar eventos anidados sin deadlock).
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<RecordEventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: RecordEventKind, handler: Arc<dyn EventHandler>) {
        if let Ok(mut guard) = self.handlers.lock() {
            guard.entry(kind).or_default().push(handler);
        }
    }

    /// Suscribe el handler a todos los tipos de evento soportados.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        for kind in [RecordEventKind::BeforeCreate,
                     RecordEventKind::AfterCreate,
                     RecordEventKind::BeforeUpdate,
                     RecordEventKind::AfterUpdate,
                     RecordEventKind::BeforeDelete,
                     RecordEventKind::AfterDelete]
        {
            self.subscribe(kind, Arc::clone(&handler));
        }
    }

    /// Publica sincrónicamente. El primer error de handler corta y se
    /// propaga al publicador (en eventos before, aborta la transacción).
    pub fn publish(&self, conn: &mut PgConnection, event: &mut RecordEvent) -> Result<(), EngineError> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let guard = self.handlers
                            .lock()
                            .map_err(|_| EngineError::Internal("event bus lock poisoned".into()))?;
            guard.get(&event.kind).cloned().unwrap_or_default()
        };
        debug!("bus: publishing {} for {} to {} handler(s)",
               event.kind.event_type(),
               event.object_api_name,
               handlers.len());
        for handler in handlers {
            handler.handle(conn, event)?;
        }
        Ok(())
    }
}
