//! Flujos: automatizaciones disparadas por eventos de registro o por cron,
//! sus pasos (multistep), instancias en ejecución y work items de aprobación.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Disparador de un flujo. La comparación contra eventos es case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    Scheduled,
}

impl TriggerType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "beforecreate" | "before_create" => Some(Self::BeforeCreate),
            "aftercreate" | "after_create" => Some(Self::AfterCreate),
            "beforeupdate" | "before_update" => Some(Self::BeforeUpdate),
            "afterupdate" | "after_update" => Some(Self::AfterUpdate),
            "beforedelete" | "before_delete" => Some(Self::BeforeDelete),
            "afterdelete" | "after_delete" => Some(Self::AfterDelete),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeCreate => "beforeCreate",
            Self::AfterCreate => "afterCreate",
            Self::BeforeUpdate => "beforeUpdate",
            Self::AfterUpdate => "afterUpdate",
            Self::BeforeDelete => "beforeDelete",
            Self::AfterDelete => "afterDelete",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn is_before(&self) -> bool {
        matches!(self, Self::BeforeCreate | Self::BeforeUpdate | Self::BeforeDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    Simple,
    Multistep,
}

impl FlowType {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("multistep") {
            Self::Multistep
        } else {
            Self::Simple
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Multistep => "multistep",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Draft,
    Active,
    Inactive,
}

impl FlowStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            _ => Self::Draft,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }
}

/// Automatización ligada a un disparador. `action_config` lleva las claves
/// reconocidas por el servicio de acciones; para flujos multistep va vacío y
/// los pasos viven en `FlowStepDef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDef {
    pub id: Uuid,
    pub name: String,
    pub trigger_object: String,
    pub trigger_type: TriggerType,
    pub trigger_condition: Option<String>,
    pub flow_type: FlowType,
    pub action_type: Option<String>,
    pub action_config: Option<Value>,
    pub status: FlowStatus,
    pub schedule: Option<String>,
    pub schedule_timezone: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

impl FlowDef {
    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    /// Un flujo multistep se reconoce por tipo declarado y action_type vacío.
    pub fn is_multistep(&self) -> bool {
        self.flow_type == FlowType::Multistep
           && self.action_type.as_deref().map(str::trim).unwrap_or("").is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    Approval,
    Action,
}

impl StepType {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("approval") {
            Self::Approval
        } else {
            Self::Action
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Action => "action",
        }
    }
}

/// Paso de un flujo multistep. El orden de ejecución es `step_order`
/// ascendente (mínimo gana); `on_success_step` / `on_failure_step` permiten
/// saltos explícitos tras una aprobación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStepDef {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub name: String,
    pub step_order: i32,
    pub step_type: StepType,
    pub action_type: Option<String>,
    pub action_config: Option<Value>,
    pub on_success_step: Option<Uuid>,
    pub on_failure_step: Option<Uuid>,
}

/// Estado runtime de una instancia multistep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstanceState {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub object_api_name: String,
    pub record_id: Uuid,
    pub status: InstanceStatus,
    pub current_step_id: Option<Uuid>,
    pub started_date: DateTime<Utc>,
    pub paused_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub context_data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

/// Work item generado por un paso de aprobación (o por SubmitForApproval
/// simple, en cuyo caso los campos de instancia/paso van vacíos).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkItem {
    pub id: Uuid,
    pub process_id: Option<Uuid>,
    pub object_api_name: String,
    pub record_id: Uuid,
    pub status: ApprovalStatus,
    pub submitted_by_id: Uuid,
    pub approver_id: Uuid,
    pub flow_instance_id: Option<Uuid>,
    pub flow_step_id: Option<Uuid>,
    pub comments: Option<String>,
    pub submitted_date: DateTime<Utc>,
    pub approved_date: Option<DateTime<Utc>>,
}
