//! Cliente HTTP bloqueante para la acción CallWebhook.

use std::time::Duration;

use crm_core::actions::{WebhookClient, WebhookRequest};
use crm_domain::EngineError;
use log::debug;
use reqwest::blocking::Client;
use reqwest::Method;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpWebhookClient {
    client: Client,
}

impl HttpWebhookClient {
    pub fn new() -> Result<Self, EngineError> {
        let client = Client::builder().timeout(WEBHOOK_TIMEOUT)
                                      .build()
                                      .map_err(|e| EngineError::Config(format!("webhook client build: {e}")))?;
        Ok(Self { client })
    }
}

impl WebhookClient for HttpWebhookClient {
    fn call(&self, request: &WebhookRequest) -> Result<(), EngineError> {
        let method: Method = request.normalized_method()?
                                    .parse()
                                    .map_err(|_| EngineError::Config("bad webhook method".into()))?;
        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }
        let response = builder.send()
                              .map_err(|e| EngineError::Transient(format!("webhook call to {}: {e}", request.url)))?;
        let status = response.status();
        debug!("webhook: {} {} -> {}", request.method, request.url, status);
        // 2xx y 3xx cuentan como entrega; el resto es error del handler.
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(EngineError::Transient(format!("webhook {} returned status {}", request.url, status)))
        }
    }
}
