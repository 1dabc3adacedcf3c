//! Cableado del motor completo.
//!
//! El grafo de servicios tiene ciclos lógicos (persistencia ↔ flujos vía
//! eventos); se cierran en dos tiempos: primero se construye la cadena
//! acíclica (bus → records → actions → instances → executor) y al final el
//! ejecutor se suscribe al bus, que es el enganche tardío equivalente al
//! set-after-construction.

use std::sync::Arc;

use log::info;

use crm_core::actions::{CredentialHasher, EmailSender, WebhookClient};
use crm_core::catalog::Catalog;
use crm_core::permission::RoleHierarchy;
use crm_core::validator::Validator;
use crm_domain::EngineError;
use crm_persistence::catalog_store::PgMetadataSource;
use crm_persistence::config::EngineConfig;
use crm_persistence::schema_manager::SchemaManager;
use crm_persistence::tx::{ConnectionProvider, PgPool, PoolProvider};

use crate::bus::EventBus;
use crate::flows::{ActionService, FlowExecutor, FlowInstanceManager};
use crate::outbox_worker::OutboxWorker;
use crate::permissions::PermissionEngine;
use crate::records::RecordService;
use crate::rollups::RollupEngine;
use crate::scheduler::Scheduler;

/// Motor armado: servicios compartidos listos para usar desde la capa de
/// transporte o desde los workers.
pub struct Engine {
    pub provider: Arc<dyn ConnectionProvider>,
    pub catalog: Arc<Catalog>,
    pub validator: Arc<Validator>,
    pub permissions: Arc<PermissionEngine>,
    pub schema_manager: Arc<SchemaManager>,
    pub bus: Arc<EventBus>,
    pub records: Arc<RecordService>,
    pub actions: Arc<ActionService>,
    pub instances: Arc<FlowInstanceManager>,
    pub outbox_worker: Arc<OutboxWorker>,
    pub scheduler: Arc<Scheduler>,
    pub config: EngineConfig,
}

impl Engine {
    /// Levanta ambos workers de background.
    pub fn start_workers(&self) {
        self.outbox_worker.start();
        self.scheduler.start();
        info!("engine workers started");
    }

    /// Shutdown ordenado: frena el scheduler (drena jobs) y después el
    /// worker del outbox. Idempotente.
    pub fn stop_workers(&self) {
        self.scheduler.stop();
        self.outbox_worker.stop();
        info!("engine workers stopped");
    }

    /// Invalidación del catálogo tras mutar metadatos por fuera del schema
    /// manager (tests, seeds).
    pub fn invalidate_metadata(&self) {
        self.catalog.invalidate_cache();
    }
}

pub struct EngineBuilder {
    pool: PgPool,
    config: EngineConfig,
    email: Arc<dyn EmailSender>,
    webhook: Arc<dyn WebhookClient>,
    hasher: Arc<dyn CredentialHasher>,
}

impl EngineBuilder {
    pub fn new(pool: PgPool, email: Arc<dyn EmailSender>, webhook: Arc<dyn WebhookClient>,
               hasher: Arc<dyn CredentialHasher>)
               -> Self {
        Self { pool,
               config: EngineConfig::default(),
               email,
               webhook,
               hasher }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let provider: Arc<dyn ConnectionProvider> = Arc::new(PoolProvider { pool: self.pool });

        let source = Arc::new(PgMetadataSource::new(Arc::clone(&provider)));
        let catalog = Arc::new(Catalog::new(source)?);
        let validator = Arc::new(Validator::new());
        let roles = Arc::new(RoleHierarchy::new());
        let permissions = Arc::new(PermissionEngine::new(Arc::clone(&catalog), roles));
        {
            let mut conn = provider.connection().map_err(EngineError::from)?;
            permissions.refresh_role_hierarchy(&mut conn)?;
        }
        let schema_manager = Arc::new(SchemaManager::new(Arc::clone(&provider)));
        schema_manager.attach_catalog(Arc::clone(&catalog));
        let rollups = Arc::new(RollupEngine::new(Arc::clone(&catalog)));
        let bus = Arc::new(EventBus::new());

        let records = Arc::new(RecordService::new(Arc::clone(&provider),
                                                  Arc::clone(&catalog),
                                                  Arc::clone(&validator),
                                                  Arc::clone(&permissions),
                                                  rollups,
                                                  Arc::clone(&bus)));
        let actions = Arc::new(ActionService::new(Arc::clone(&catalog),
                                                  Arc::clone(&records),
                                                  Arc::clone(&permissions),
                                                  self.email,
                                                  self.webhook,
                                                  Arc::clone(&self.hasher)));
        let instances = Arc::new(FlowInstanceManager::new(Arc::clone(&provider),
                                                          Arc::clone(&catalog),
                                                          Arc::clone(&actions)));
        let executor = Arc::new(FlowExecutor::new(Arc::clone(&catalog),
                                                  Arc::clone(&actions),
                                                  Arc::clone(&instances),
                                                  Arc::clone(&self.hasher)));
        // Enganche tardío: recién acá el ciclo records → bus → executor →
        // actions → records queda cerrado.
        bus.subscribe_all(executor);

        let outbox_worker = Arc::new(OutboxWorker::new(Arc::clone(&provider),
                                                       Arc::clone(&bus),
                                                       self.config.clone()));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&provider),
                                                Arc::clone(&catalog),
                                                Arc::clone(&actions),
                                                self.config.clone()));

        Ok(Engine { provider,
                    catalog,
                    validator,
                    permissions,
                    schema_manager,
                    bus,
                    records,
                    actions,
                    instances,
                    outbox_worker,
                    scheduler,
                    config: self.config })
    }
}
