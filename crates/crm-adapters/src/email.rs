//! Sender de email de desarrollo: loguea en vez de transportar.

use crm_core::actions::{EmailMessage, EmailSender};
use crm_domain::EngineError;
use log::info;

#[derive(Default)]
pub struct LogEmailSender;

impl LogEmailSender {
    pub fn new() -> Self {
        Self
    }
}

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<(), EngineError> {
        info!("email to {:?} (cc {:?}, bcc {:?}): {} | {}",
              message.to,
              message.cc,
              message.bcc,
              message.subject,
              message.body);
        Ok(())
    }
}
