//! Scheduler de flujos cron: ticker con lock de ejecución single-writer.
//!
//! Cada tick itera los flujos programados:
//! 1. Saltea los no Activos o sin schedule.
//! 2. Vencimiento: `next_run_at <= now`, o primera corrida (next y last
//!    nulos).
//! 3. Claim por UPDATE condicional sobre `is_running`; 0 filas ⇒ otro
//!    scheduler lo tiene: exactamente un worker ejecuta el flujo por tick.
//! 4. El job corre en un thread propio bajo `catch_unwind` y sesión
//!    sintética de sistema; el lock se libera siempre, incluso ante panic.
//! 5. Al cerrar se estampa `last_run_at` y se computa `next_run_at` en la
//!    timezone declarada (UTC ante timezone inválida).
//!
//! El shutdown drena los jobs en vuelo (join de todos los handles) y `stop`
//! es idempotente.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, warn};

use crm_core::catalog::Catalog;
use crm_core::flow::schedule;
use crm_domain::{EngineError, FlowDef, FlowType, SObject, UserContext};
use crm_persistence::config::EngineConfig;
use crm_persistence::flow_store;
use crm_persistence::tx::ConnectionProvider;

use crate::flows::actions::{ActionCtx, ActionService};

pub struct Scheduler {
    provider: Arc<dyn ConnectionProvider>,
    catalog: Arc<Catalog>,
    actions: Arc<ActionService>,
    config: EngineConfig,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    jobs: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(provider: Arc<dyn ConnectionProvider>, catalog: Arc<Catalog>, actions: Arc<ActionService>,
               config: EngineConfig)
               -> Self {
        Self { provider,
               catalog,
               actions,
               config,
               stop_tx: Mutex::new(None),
               handle: Mutex::new(None),
               jobs: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn start(self: &Arc<Self>) {
        let mut stop_guard = match self.stop_tx.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if stop_guard.is_some() {
            warn!("scheduler already running");
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        *stop_guard = Some(tx);
        let scheduler = Arc::clone(self);
        let interval = self.config.scheduler_check_interval;
        let handle = std::thread::spawn(move || {
            debug!("scheduler started (interval {:?})", interval);
            loop {
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => scheduler.tick(),
                }
            }
            debug!("scheduler stopped");
        });
        if let Ok(mut h) = self.handle.lock() {
            *h = Some(handle);
        }
    }

    /// Un ciclo de chequeo. Expuesto para tests.
    pub fn tick(&self) {
        let flows = match self.catalog.get_scheduled_flows() {
            Ok(flows) => flows,
            Err(e) => {
                warn!("scheduler: could not read scheduled flows: {e}");
                return;
            }
        };
        let now = Utc::now();
        for flow in flows {
            if !flow.is_active() || flow.schedule.as_deref().map(str::trim).unwrap_or("").is_empty() {
                continue;
            }
            if !schedule::is_due(&flow, now) {
                continue;
            }
            match self.try_claim(flow.id) {
                Ok(true) => self.spawn_job(flow),
                Ok(false) => debug!("scheduler: flow '{}' already claimed by another worker", flow.name),
                Err(e) => warn!("scheduler: claim of '{}' failed: {e}", flow.name),
            }
        }
        // Poda de handles de jobs ya terminados.
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.retain(|h| !h.is_finished());
        }
    }

    fn try_claim(&self, flow_id: uuid::Uuid) -> Result<bool, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        flow_store::try_claim_scheduled(&mut conn, flow_id)
    }

    fn spawn_job(&self, flow: FlowDef) {
        let provider = Arc::clone(&self.provider);
        let actions = Arc::clone(&self.actions);
        let catalog = Arc::clone(&self.catalog);
        let max_runtime = self.config.scheduler_max_job_runtime;
        let job = std::thread::spawn(move || {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| Self::run_flow_action(&provider, &actions, &flow)));
            match outcome {
                Ok(Ok(())) => debug!("scheduler: flow '{}' ran in {:?}", flow.name, started.elapsed()),
                Ok(Err(e)) => error!("scheduler: flow '{}' failed: {e}", flow.name),
                Err(_) => error!("scheduler: flow '{}' panicked, recovering", flow.name),
            }
            if started.elapsed() > max_runtime {
                warn!("scheduler: flow '{}' exceeded max runtime ({:?})", flow.name, max_runtime);
            }
            // El lock se libera SIEMPRE, y se estampan last/next run.
            let next = flow.schedule
                           .as_deref()
                           .and_then(|expr| {
                               schedule::next_run(expr, flow.schedule_timezone.as_deref(), Utc::now())
                                   .map_err(|e| warn!("scheduler: next run of '{}' not computable: {e}", flow.name))
                                   .ok()
                                   .flatten()
                           });
            match provider.connection() {
                Ok(mut conn) => {
                    if let Err(e) = flow_store::finish_scheduled_run(&mut conn, flow.id, Utc::now(), next) {
                        error!("scheduler: could not release lock of '{}': {e}", flow.name);
                        let _ = flow_store::release_scheduled(&mut conn, flow.id);
                    }
                }
                Err(e) => error!("scheduler: no connection to release lock of '{}': {e}", flow.name),
            }
            // El catálogo cachea next_run_at: invalidar para el próximo tick.
            catalog.invalidate_cache();
        });
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
    }

    /// Ejecuta la acción configurada del flujo bajo sesión de sistema. Los
    /// flujos multistep programados no están soportados en este core: se
    /// ejecuta la acción configurada si existe, como en el comportamiento de
    /// origen.
    fn run_flow_action(provider: &Arc<dyn ConnectionProvider>, actions: &Arc<ActionService>, flow: &FlowDef)
                       -> Result<(), EngineError> {
        if flow.flow_type == FlowType::Multistep {
            warn!("scheduler: multistep scheduled flow '{}' runs its configured action only", flow.name);
        }
        let Some(action_type) = flow.action_type.as_deref().filter(|a| !a.trim().is_empty()) else {
            warn!("scheduler: flow '{}' has no executable action", flow.name);
            return Ok(());
        };
        let system = UserContext::system();
        let record = SObject::new();
        let ctx = ActionCtx { object_api_name: &flow.trigger_object,
                              record: &record,
                              old: None,
                              user: &system,
                              flow_instance_id: None,
                              flow_step_id: None };
        let mut conn = provider.connection().map_err(EngineError::from)?;
        actions.execute(&mut conn, action_type, flow.action_config.as_ref(), &ctx)?;
        Ok(())
    }

    /// Shutdown idempotente: señal de stop, join del ticker y drenaje de los
    /// jobs en vuelo.
    pub fn stop(&self) {
        let sender = self.stop_tx.lock().ok().and_then(|mut g| g.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().ok().and_then(|mut g| g.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
        let drained: Vec<JoinHandle<()>> = self.jobs
                                               .lock()
                                               .map(|mut g| g.drain(..).collect())
                                               .unwrap_or_default();
        for job in drained {
            let _ = job.join();
        }
    }
}
