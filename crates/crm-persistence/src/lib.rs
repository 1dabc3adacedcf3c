//! crm-persistence
//!
//! Capa Postgres (Diesel) del motor de registros:
//! - `schema`: tablas de sistema declaradas para compilar queries tipadas.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env (pool y constantes del
//!   motor).
//! - `tx`: transacciones con reintento acotado ante errores transitorios.
//! - `schema_manager`: DDL de tablas físicas reconciliado con las tablas de
//!   metadatos (adopción de huérfanos, columnas fantasma, compensaciones).
//! - `record_repo`: I/O genérico de filas sobre tablas de usuario (SObject ↔
//!   jsonb, locks de fila).
//! - `catalog_store`: `MetadataSource` que arma el snapshot del catálogo.
//! - `access_store`: consultas de permisos, roles, grupos y shares.
//! - `flow_store`: runtime de flujos (lock de ejecución, próximos runs) e
//!   instancias multistep.
//! - `outbox_store`: cola transaccional de eventos con claim SKIP LOCKED.
//! - `auto_number`: incrementos atómicos bajo lock de fila.
//! - `audit`: filas de auditoría y papelera de reciclaje.

pub mod access_store;
pub mod audit;
pub mod auto_number;
pub mod catalog_store;
pub mod config;
pub mod error;
pub mod flow_store;
pub mod migrations;
pub mod outbox_store;
pub mod record_repo;
pub mod schema;
pub mod schema_manager;
pub mod tx;

pub use config::{init_dotenv, DbConfig, EngineConfig};
pub use error::PersistenceError;
pub use tx::{build_pool, run_in_transaction, with_tx_retry, ConnectionProvider, PgPool, PoolProvider};
