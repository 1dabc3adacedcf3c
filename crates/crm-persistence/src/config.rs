//! Carga de configuración de conexión y constantes del motor desde variables
//! de entorno. Usa convención `DATABASE_URL` y parámetros opcionales.

use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").expect("DATABASE_URL no definido");
        let min_connections = env::var("DATABASE_MIN_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(2);
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
        Self { url, min_connections, max_connections }
    }
}

/// Constantes nombradas del motor: intervalos de workers, límites de reintento
/// y retención. Todas sobreescribibles por entorno.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Intervalo de sondeo del worker del outbox.
    pub outbox_poll_interval: Duration,
    /// Tamaño máximo del lote de eventos pendientes por tick.
    pub outbox_batch_size: i64,
    /// Reintentos de publicación antes de marcar Failed.
    pub outbox_max_retries: i32,
    /// Retención de eventos procesados antes del cleanup.
    pub outbox_retention: Duration,
    /// Intervalo de chequeo del scheduler de flujos cron.
    pub scheduler_check_interval: Duration,
    /// Tiempo máximo de ejecución de un job programado.
    pub scheduler_max_job_runtime: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { outbox_poll_interval: Duration::from_millis(500),
               outbox_batch_size: 100,
               outbox_max_retries: 5,
               outbox_retention: Duration::from_secs(7 * 24 * 3600),
               scheduler_check_interval: Duration::from_secs(30),
               scheduler_max_job_runtime: Duration::from_secs(300) }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let defaults = Self::default();
        Self { outbox_poll_interval:
                   Duration::from_millis(env_u64("OUTBOX_POLL_INTERVAL_MS",
                                                 defaults.outbox_poll_interval.as_millis() as u64)),
               outbox_batch_size: env_u64("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size as u64) as i64,
               outbox_max_retries: env_u64("OUTBOX_MAX_RETRIES", defaults.outbox_max_retries as u64) as i32,
               outbox_retention: Duration::from_secs(env_u64("OUTBOX_RETENTION_SECS",
                                                             defaults.outbox_retention.as_secs())),
               scheduler_check_interval:
                   Duration::from_secs(env_u64("SCHEDULER_CHECK_INTERVAL_SECS",
                                               defaults.scheduler_check_interval.as_secs())),
               scheduler_max_job_runtime:
                   Duration::from_secs(env_u64("SCHEDULER_MAX_JOB_RUNTIME_SECS",
                                               defaults.scheduler_max_job_runtime.as_secs())) }
    }
}
