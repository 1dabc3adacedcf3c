//! Worker del outbox: publica los eventos after commiteados, con reintentos
//! acotados y entrega at-least-once.
//!
//! Cada tick:
//! 1. Lee hasta `outbox_batch_size` pendientes por orden de creación (sin
//!    lock).
//! 2. Por fila, abre una transacción e intenta el claim con
//!    `FOR UPDATE SKIP LOCKED`; claim vacío ⇒ otro worker la tiene.
//! 3. Payload indecodificable ⇒ Failed directo con el error.
//! 4. Publica por el event bus. Error de handler ⇒ retry_count += 1 (Failed
//!    al llegar al máximo) y commit del bookkeeping.
//! 5. Éxito ⇒ Processed con processed_date.
//!
//! El stop es idempotente: canal de parada + join del thread, ambos bajo
//! Option tomado una sola vez.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crm_domain::{EngineError, RecordEvent};
use crm_persistence::config::EngineConfig;
use crm_persistence::tx::{run_in_transaction, ConnectionProvider};
use crm_persistence::outbox_store::{self, OutboxRow};

use crate::bus::EventBus;

pub struct OutboxWorker {
    provider: Arc<dyn ConnectionProvider>,
    bus: Arc<EventBus>,
    config: EngineConfig,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxWorker {
    pub fn new(provider: Arc<dyn ConnectionProvider>, bus: Arc<EventBus>, config: EngineConfig) -> Self {
        Self { provider,
               bus,
               config,
               stop_tx: Mutex::new(None),
               handle: Mutex::new(None) }
    }

    pub fn start(self: &Arc<Self>) {
        let mut stop_guard = match self.stop_tx.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if stop_guard.is_some() {
            warn!("outbox worker already running");
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        *stop_guard = Some(tx);
        let worker = Arc::clone(self);
        let interval = self.config.outbox_poll_interval;
        let handle = std::thread::spawn(move || {
            debug!("outbox worker started (interval {:?})", interval);
            loop {
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => worker.tick(),
                }
            }
            debug!("outbox worker stopped");
        });
        if let Ok(mut h) = self.handle.lock() {
            *h = Some(handle);
        }
    }

    /// Un ciclo de publicación. Expuesto para tests y para drenaje manual.
    pub fn tick(&self) {
        let mut conn = match self.provider.connection() {
            Ok(c) => c,
            Err(e) => {
                warn!("outbox worker: no connection available: {e}");
                return;
            }
        };
        let pending = match outbox_store::fetch_pending(&mut conn, self.config.outbox_batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("outbox worker: fetch failed: {e}");
                return;
            }
        };
        for row in pending {
            if let Err(e) = self.process_one(&mut conn, &row) {
                // El error ya quedó registrado en la fila; el loop sigue con
                // el resto del lote.
                error!("outbox worker: event {} processing error: {e}", row.id);
            }
        }
    }

    fn process_one(&self, conn: &mut diesel::PgConnection, row: &OutboxRow) -> Result<(), EngineError> {
        run_in_transaction(conn, |tx| {
            if !outbox_store::claim(tx, row.id)? {
                // Otro worker lo tomó entre el fetch y el claim.
                return Ok(());
            }
            let mut event: RecordEvent = match serde_json::from_value(row.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("outbox worker: event {} has malformed payload: {e}", row.id);
                    outbox_store::mark_failed(tx, row.id, &format!("malformed payload: {e}"))?;
                    return Ok(());
                }
            };
            match self.bus.publish(tx, &mut event) {
                Ok(()) => {
                    outbox_store::mark_processed(tx, row.id)?;
                    debug!("outbox worker: event {} processed", row.id);
                }
                Err(e) => {
                    let status = outbox_store::record_failure(tx, row, &e.to_string(),
                                                              self.config.outbox_max_retries)?;
                    warn!("outbox worker: event {} publish failed (retry {}): {e} -> {}",
                          row.id,
                          row.retry_count + 1,
                          status.as_str());
                }
            }
            Ok(())
        })
    }

    /// Parada idempotente: envía la señal una única vez y espera al thread.
    pub fn stop(&self) {
        let sender = self.stop_tx.lock().ok().and_then(|mut g| g.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().ok().and_then(|mut g| g.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    /// Limpieza de procesados fuera de la ventana de retención.
    pub fn cleanup(&self) -> Result<usize, EngineError> {
        let mut conn = self.provider.connection().map_err(EngineError::from)?;
        let cutoff = chrono::Utc::now()
                     - chrono::Duration::from_std(self.config.outbox_retention)
                         .map_err(|e| EngineError::Config(format!("bad retention window: {e}")))?;
        outbox_store::cleanup_processed(&mut conn, cutoff)
    }
}

impl Drop for OutboxWorker {
    fn drop(&mut self) {
        // No join en drop (el thread sostiene un Arc al worker); la señal de
        // stop alcanza para que el loop termine.
        if let Ok(mut g) = self.stop_tx.lock() {
            if let Some(tx) = g.take() {
                let _ = tx.send(());
            }
        }
    }
}
