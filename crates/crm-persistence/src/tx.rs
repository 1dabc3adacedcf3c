//! Pool de conexiones y transacciones con reintento acotado.
//!
//! Propagación de transacción: el portador explícito es el `&mut
//! PgConnection` que baja por la cadena de llamadas. Diesel anida
//! transacciones vía savepoints, de modo que una operación invocada dentro de
//! una transacción abierta se suma a ella; invocada sin transacción, ejecuta
//! standalone.
//!
//! Política de reintento (`with_tx_retry`):
//! - Hasta 3 intentos, cada uno con transacción fresca.
//! - Sólo ante errores transitorios (conflicto de serialización, deadlock,
//!   fallo de pool/conexión).
//! - Backoff pequeño: 15ms, 30ms, 45ms, con `warn!` por intento.

use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;

use crm_domain::EngineError;

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;

/// Alias del pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PooledPgConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones (inyectable en tests).
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PooledPgConnection, PersistenceError>;
}

/// Implementación concreta respaldada por un `PgPool`.
#[derive(Clone)]
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PooledPgConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Construye un pool Postgres r2d2 y corre las migraciones pendientes una vez.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = if min_size == 0 { 1 } else { min_size };
    let validated_max = if max_size == 0 { 1 } else { max_size };
    if validated_min > validated_max {
        warn!("min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

// Diesel exige que el error de la transacción convierta desde el error del
// driver; este envoltorio separa el fallo de commit/rollback del error de
// negocio.
enum TxFail {
    Db(diesel::result::Error),
    App(EngineError),
}

impl From<diesel::result::Error> for TxFail {
    fn from(e: diesel::result::Error) -> Self {
        Self::Db(e)
    }
}

/// Ejecuta `f` dentro de una transacción read-write sobre la conexión dada.
/// Si la conexión ya está en transacción, Diesel abre un savepoint (la
/// operación se une a la transacción del llamador).
pub fn run_in_transaction<T, F>(conn: &mut PgConnection, f: F) -> Result<T, EngineError>
    where F: FnOnce(&mut PgConnection) -> Result<T, EngineError>
{
    let result = conn.transaction::<T, TxFail, _>(|tx_conn| f(tx_conn).map_err(TxFail::App));
    match result {
        Ok(v) => Ok(v),
        Err(TxFail::App(e)) => Err(e),
        Err(TxFail::Db(e)) => Err(PersistenceError::from(e).into()),
    }
}

/// Unidad de trabajo transaccional con reintento: cada intento toma una
/// conexión nueva del provider y abre una transacción fresca.
pub fn with_tx_retry<T, F>(provider: &dyn ConnectionProvider, mut f: F) -> Result<T, EngineError>
    where F: FnMut(&mut PgConnection) -> Result<T, EngineError>
{
    let mut attempts = 0;
    loop {
        let attempt = (|| {
            let mut conn = provider.connection().map_err(EngineError::from)?;
            run_in_transaction(&mut conn, &mut f)
        })();
        match attempt {
            Err(e) if e.is_retryable() && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable transaction error (attempt {}): {e} -> sleeping {}ms",
                      attempts + 1,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}
