//! Lógica pura de flujos: máquina de estados de instancias multistep y
//! matemática de schedules cron.

pub mod machine;
pub mod schedule;

pub use machine::{check_transition, first_step, next_step, ordered_steps};
pub use schedule::{is_due, next_run};
