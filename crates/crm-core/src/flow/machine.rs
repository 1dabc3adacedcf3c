//! Máquina de estados de instancias de flujo multistep.
//!
//! Transiciones permitidas:
//! - Running → Paused (pausa en paso de aprobación).
//! - Paused → Running (resume tras la decisión).
//! - Running → Completed (agotamiento de pasos; terminal).
//! - Running | Paused → Failed (terminal, el error va a context_data).
//! Cualquier otra transición se rechaza con error.

use crm_domain::{EngineError, FlowStepDef, InstanceStatus};
use uuid::Uuid;

pub fn check_transition(from: InstanceStatus, to: InstanceStatus) -> Result<(), EngineError> {
    use InstanceStatus::*;
    let allowed = matches!((from, to),
                           (Running, Paused) | (Paused, Running) | (Running, Completed) | (Running, Failed)
                           | (Paused, Failed));
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Conflict(format!("invalid flow instance transition {} -> {}",
                                          from.as_str(),
                                          to.as_str())))
    }
}

/// Pasos ordenados por `step_order` ascendente, id como desempate estable.
pub fn ordered_steps(steps: &mut Vec<FlowStepDef>) {
    steps.sort_by(|a, b| a.step_order.cmp(&b.step_order).then(a.id.cmp(&b.id)));
}

/// Primer paso a ejecutar (step_order mínimo).
pub fn first_step(steps: &[FlowStepDef]) -> Option<&FlowStepDef> {
    steps.iter().min_by(|a, b| a.step_order.cmp(&b.step_order).then(a.id.cmp(&b.id)))
}

/// Paso siguiente tras resolver `current`: arista explícita
/// (`on_success_step` / `on_failure_step`) si está definida, si no el
/// siguiente por orden. `None` ⇒ no quedan pasos (Complete).
pub fn next_step<'a>(steps: &'a [FlowStepDef], current: &FlowStepDef, approved: bool) -> Option<&'a FlowStepDef> {
    let explicit = if approved { current.on_success_step } else { current.on_failure_step };
    if let Some(target) = explicit {
        return steps.iter().find(|s| s.id == target);
    }
    if !approved {
        // Rechazo sin arista explícita: el flujo termina sin ejecutar más
        // pasos.
        return None;
    }
    steps.iter()
         .filter(|s| {
             (s.step_order, s.id) > (current.step_order, current.id)
         })
         .min_by(|a, b| a.step_order.cmp(&b.step_order).then(a.id.cmp(&b.id)))
}

/// Busca un paso por id.
pub fn step_by_id(steps: &[FlowStepDef], id: Uuid) -> Option<&FlowStepDef> {
    steps.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::StepType;

    fn step(order: i32, n: u128) -> FlowStepDef {
        FlowStepDef { id: Uuid::from_u128(n),
                      flow_id: Uuid::from_u128(99),
                      name: format!("step{order}"),
                      step_order: order,
                      step_type: StepType::Action,
                      action_type: Some("UpdateRecord".into()),
                      action_config: None,
                      on_success_step: None,
                      on_failure_step: None }
    }

    #[test]
    fn transitions() {
        use InstanceStatus::*;
        assert!(check_transition(Running, Paused).is_ok());
        assert!(check_transition(Paused, Running).is_ok());
        assert!(check_transition(Running, Completed).is_ok());
        assert!(check_transition(Paused, Failed).is_ok());
        assert!(check_transition(Paused, Completed).is_err());
        assert!(check_transition(Completed, Running).is_err());
        assert!(check_transition(Failed, Running).is_err());
    }

    #[test]
    fn min_order_wins_and_sequence_advances() {
        let steps = vec![step(20, 2), step(10, 1), step(30, 3)];
        assert_eq!(first_step(&steps).unwrap().id, Uuid::from_u128(1));
        let next = next_step(&steps, &step(10, 1), true).unwrap();
        assert_eq!(next.id, Uuid::from_u128(2));
        assert!(next_step(&steps, &step(30, 3), true).is_none());
    }

    #[test]
    fn explicit_edges_override_order() {
        let mut branch = step(10, 1);
        branch.on_success_step = Some(Uuid::from_u128(3));
        branch.on_failure_step = Some(Uuid::from_u128(2));
        let steps = vec![branch.clone(), step(20, 2), step(30, 3)];
        assert_eq!(next_step(&steps, &branch, true).unwrap().id, Uuid::from_u128(3));
        assert_eq!(next_step(&steps, &branch, false).unwrap().id, Uuid::from_u128(2));
    }

    #[test]
    fn rejection_without_edge_ends_flow() {
        let steps = vec![step(10, 1), step(20, 2)];
        assert!(next_step(&steps, &step(10, 1), false).is_none());
    }
}
