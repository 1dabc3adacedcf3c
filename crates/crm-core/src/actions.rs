//! Modelo de configuración de acciones y traits de salida.
//!
//! El servicio de acciones vive en la capa de orquestación; aquí se definen
//! los contratos neutrales: tipos de acción reconocidos, mensajes de salida y
//! las interfaces estrechas que implementan los adaptadores (webhook, email,
//! hashing de credenciales).

use std::collections::HashMap;

use crm_domain::EngineError;
use serde_json::Value;

/// Tipos de acción reconocidos por el ejecutor de flujos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    UpdateRecord,
    CreateRecord,
    SendEmail,
    CallWebhook,
    SubmitForApproval,
    ExecuteAction,
    Composite,
}

impl ActionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "updaterecord" => Some(Self::UpdateRecord),
            "createrecord" => Some(Self::CreateRecord),
            "sendemail" => Some(Self::SendEmail),
            "callwebhook" => Some(Self::CallWebhook),
            "submitforapproval" => Some(Self::SubmitForApproval),
            "executeaction" => Some(Self::ExecuteAction),
            "composite" => Some(Self::Composite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateRecord => "UpdateRecord",
            Self::CreateRecord => "CreateRecord",
            Self::SendEmail => "SendEmail",
            Self::CallWebhook => "CallWebhook",
            Self::SubmitForApproval => "SubmitForApproval",
            Self::ExecuteAction => "ExecuteAction",
            Self::Composite => "Composite",
        }
    }
}

/// Mensaje saliente de la acción SendEmail. El transporte SMTP queda del lado
/// del adaptador.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
}

pub trait EmailSender: Send + Sync {
    fn send(&self, message: &EmailMessage) -> Result<(), EngineError>;
}

/// Request saliente de CallWebhook. Métodos admitidos: GET, POST, PUT, PATCH,
/// DELETE (default POST). El cliente aplica timeout de 30 segundos y trata
/// todo status fuera de 2xx/3xx como error.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub payload: Option<Value>,
    pub headers: HashMap<String, String>,
}

impl WebhookRequest {
    /// Normaliza y valida el método; default POST.
    pub fn normalized_method(&self) -> Result<String, EngineError> {
        let m = if self.method.trim().is_empty() {
            "POST".to_string()
        } else {
            self.method.trim().to_ascii_uppercase()
        };
        match m.as_str() {
            "GET" | "POST" | "PUT" | "PATCH" | "DELETE" => Ok(m),
            other => Err(EngineError::validation("method", format!("unsupported webhook method '{other}'"))),
        }
    }
}

pub trait WebhookClient: Send + Sync {
    fn call(&self, request: &WebhookRequest) -> Result<(), EngineError>;
}

/// Interfaz estrecha de hashing de credenciales (función BCRYPT de fórmulas y
/// flujos de alta de usuarios). La verificación debe responder igual ante
/// password inválido y usuario inexistente.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, plain: &str) -> String;
    fn verify(&self, plain: &str, hashed: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_parsing_is_flexible() {
        assert_eq!(ActionType::parse("UpdateRecord"), Some(ActionType::UpdateRecord));
        assert_eq!(ActionType::parse("update_record"), Some(ActionType::UpdateRecord));
        assert_eq!(ActionType::parse("SENDEMAIL"), Some(ActionType::SendEmail));
        assert_eq!(ActionType::parse("nope"), None);
    }

    #[test]
    fn webhook_method_defaults_to_post() {
        let req = WebhookRequest { url: "https://example.test/hook".into(),
                                   method: String::new(),
                                   payload: None,
                                   headers: HashMap::new() };
        assert_eq!(req.normalized_method().unwrap(), "POST");
        let bad = WebhookRequest { method: "TRACE".into(),
                                   ..req };
        assert!(bad.normalized_method().is_err());
    }
}
