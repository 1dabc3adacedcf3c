//! crm-adapters: implementaciones concretas de los traits de salida del core.
//!
//! - `webhook`: cliente HTTP bloqueante (timeout 30s, status no exitoso es
//!   error).
//! - `email`: sender de desarrollo que loguea el mensaje (el transporte SMTP
//!   queda fuera del core).
//! - `hasher`: hashing de credenciales con sal sobre SHA-256, detrás de la
//!   interfaz estrecha `CredentialHasher`.

pub mod email;
pub mod hasher;
pub mod webhook;

pub use email::LogEmailSender;
pub use hasher::SaltedSha256Hasher;
pub use webhook::HttpWebhookClient;
