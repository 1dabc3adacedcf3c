//! Eventos de ciclo de vida de registros y estados del outbox transaccional.
//!
//! Los eventos `Before*` se publican sincrónicamente dentro de la transacción
//! de negocio (los handlers pueden mutar el registro); los `After*` se
//! encolan en el outbox y sólo se publican tras el commit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::TriggerType;
use crate::permission::UserContext;
use crate::value::SObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordEventKind {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl RecordEventKind {
    pub const AFTER_KINDS: [RecordEventKind; 3] = [Self::AfterCreate, Self::AfterUpdate, Self::AfterDelete];

    /// Nombre estable del tipo de evento, usado como `event_type` del outbox.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BeforeCreate => "RecordBeforeCreate",
            Self::AfterCreate => "RecordAfterCreate",
            Self::BeforeUpdate => "RecordBeforeUpdate",
            Self::AfterUpdate => "RecordAfterUpdate",
            Self::BeforeDelete => "RecordBeforeDelete",
            Self::AfterDelete => "RecordAfterDelete",
        }
    }

    pub fn parse_event_type(s: &str) -> Option<Self> {
        match s {
            "RecordBeforeCreate" => Some(Self::BeforeCreate),
            "RecordAfterCreate" => Some(Self::AfterCreate),
            "RecordBeforeUpdate" => Some(Self::BeforeUpdate),
            "RecordAfterUpdate" => Some(Self::AfterUpdate),
            "RecordBeforeDelete" => Some(Self::BeforeDelete),
            "RecordAfterDelete" => Some(Self::AfterDelete),
            _ => None,
        }
    }

    /// Disparador de flujo equivalente al evento.
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::BeforeCreate => TriggerType::BeforeCreate,
            Self::AfterCreate => TriggerType::AfterCreate,
            Self::BeforeUpdate => TriggerType::BeforeUpdate,
            Self::AfterUpdate => TriggerType::AfterUpdate,
            Self::BeforeDelete => TriggerType::BeforeDelete,
            Self::AfterDelete => TriggerType::AfterDelete,
        }
    }

    pub fn is_before(&self) -> bool {
        matches!(self, Self::BeforeCreate | Self::BeforeUpdate | Self::BeforeDelete)
    }
}

/// Payload completo de un evento de registro: objeto, registro, registro
/// previo (updates/deletes) y sesión del usuario que origina la mutación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub kind: RecordEventKind,
    pub object_api_name: String,
    pub record: SObject,
    pub old: Option<SObject>,
    pub user: UserContext,
}

impl RecordEvent {
    pub fn new(kind: RecordEventKind, object_api_name: impl Into<String>, record: SObject, old: Option<SObject>,
               user: UserContext)
               -> Self {
        Self { kind,
               object_api_name: object_api_name.into(),
               record,
               old,
               user }
    }

    pub fn record_id(&self) -> Option<Uuid> {
        self.record.id().or_else(|| self.old.as_ref().and_then(|o| o.id()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}
