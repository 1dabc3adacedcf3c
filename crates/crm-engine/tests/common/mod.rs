//! Arnés compartido de los tests de integración del motor: engine completo
//! con adaptadores de prueba (email grabador, webhook contador) y helpers de
//! esquema. Todos los tests se omiten sin DATABASE_URL.

use std::sync::{Arc, Mutex};

use crm_adapters::SaltedSha256Hasher;
use crm_core::actions::{EmailMessage, EmailSender, WebhookClient, WebhookRequest};
use crm_domain::{EngineError, FieldDef, FieldType, ObjectDef, SharingModel};
use crm_engine::{Engine, EngineBuilder};
use crm_persistence::config::{DbConfig, EngineConfig};
use crm_persistence::tx::build_pool;

#[derive(Default)]
pub struct RecordingEmailSender {
    pub sent: Mutex<Vec<EmailMessage>>,
}

impl EmailSender for RecordingEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<(), EngineError> {
        self.sent.lock().expect("email lock").push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingWebhookClient {
    pub calls: Mutex<Vec<WebhookRequest>>,
}

impl WebhookClient for CountingWebhookClient {
    fn call(&self, request: &WebhookRequest) -> Result<(), EngineError> {
        self.calls.lock().expect("webhook lock").push(request.clone());
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub emails: Arc<RecordingEmailSender>,
    pub webhooks: Arc<CountingWebhookClient>,
    pub hasher: Arc<SaltedSha256Hasher>,
}

/// Arma el engine contra la base del entorno. `None` si no hay DATABASE_URL.
pub fn harness() -> Option<Harness> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return None;
    }
    let cfg = DbConfig::from_env();
    let pool = build_pool(&cfg.url, 1, 6).expect("pool");
    let emails = Arc::new(RecordingEmailSender::default());
    let webhooks = Arc::new(CountingWebhookClient::default());
    let hasher = Arc::new(SaltedSha256Hasher::new());
    let engine = EngineBuilder::new(pool,
                                    emails.clone(),
                                    webhooks.clone(),
                                    hasher.clone()).with_config(EngineConfig { outbox_poll_interval:
                                                                                  std::time::Duration::from_millis(50),
                                                                              ..EngineConfig::default() })
                                                   .build()
                                                   .expect("engine");
    Some(Harness { engine,
                   emails,
                   webhooks,
                   hasher })
}

pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..10])
}

pub fn object_with(api_name: &str, fields: Vec<FieldDef>) -> ObjectDef {
    let mut obj = ObjectDef { api_name: api_name.to_string(),
                              label: api_name.to_string(),
                              plural_label: format!("{api_name}s"),
                              description: None,
                              is_custom: true,
                              sharing_model: SharingModel::Private,
                              app_id: None,
                              table_type: None,
                              list_fields: vec![],
                              icon: None,
                              fields: Default::default() };
    for f in fields {
        obj.add_field(f);
    }
    obj
}

pub fn text_field(api_name: &str) -> FieldDef {
    FieldDef::new(api_name, api_name, FieldType::Text)
}

/// Crea el objeto (tabla + metadatos) y refresca el catálogo.
pub fn provision(harness: &Harness, def: &ObjectDef) {
    harness.engine.schema_manager.create_table_from_definition(def).expect("provision object");
    harness.engine.invalidate_metadata();
}

/// Drena el outbox sin esperar al ticker del worker.
pub fn drain_outbox(harness: &Harness, rounds: usize) {
    for _ in 0..rounds {
        harness.engine.outbox_worker.tick();
    }
}
