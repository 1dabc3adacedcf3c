//! Matemática de schedules cron: cuándo un flujo programado está vencido y
//! cuál es su próxima ejecución.
//!
//! Formato: cron estándar de 5 campos (minuto, hora, día de mes, mes, día de
//! semana), interpretado en `schedule_timezone`; timezone vacío o inválido
//! cae a UTC con un warning.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use crm_domain::{EngineError, FlowDef};
use log::warn;

/// Un flujo está vencido cuando `next_run_at <= now`, o cuando nunca corrió
/// (next y last ambos nulos: primera ejecución).
pub fn is_due(flow: &FlowDef, now: DateTime<Utc>) -> bool {
    match flow.next_run_at {
        Some(next) => next <= now,
        None => flow.last_run_at.is_none(),
    }
}

fn resolve_tz(tz_name: Option<&str>) -> Tz {
    match tz_name.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => match Tz::from_str(name) {
            Ok(tz) => tz,
            Err(_) => {
                warn!("scheduler: invalid timezone '{name}', falling back to UTC");
                Tz::UTC
            }
        },
        None => Tz::UTC,
    }
}

/// Próxima ejecución estrictamente posterior a `after`. El crate de cron
/// trabaja con 6/7 campos; a las expresiones de 5 campos se les antepone el
/// campo de segundos.
pub fn next_run(expression: &str, tz_name: Option<&str>, after: DateTime<Utc>)
                -> Result<Option<DateTime<Utc>>, EngineError> {
    let expr = expression.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| EngineError::Config(format!("invalid cron expression '{expression}': {e}")))?;
    let tz = resolve_tz(tz_name);
    let next = schedule.after(&after.with_timezone(&tz)).next();
    Ok(next.map(|dt| dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flow(next: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> FlowDef {
        FlowDef { id: uuid::Uuid::new_v4(),
                  name: "nightly".into(),
                  trigger_object: String::new(),
                  trigger_type: crm_domain::TriggerType::Scheduled,
                  trigger_condition: None,
                  flow_type: crm_domain::FlowType::Simple,
                  action_type: Some("SendEmail".into()),
                  action_config: None,
                  status: crm_domain::FlowStatus::Active,
                  schedule: Some("0 3 * * *".into()),
                  schedule_timezone: None,
                  next_run_at: next,
                  last_run_at: last,
                  is_running: false }
    }

    #[test]
    fn due_rules() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert!(is_due(&flow(Some(now - chrono::Duration::minutes(1)), None), now));
        assert!(!is_due(&flow(Some(now + chrono::Duration::minutes(1)), None), now));
        // Primera ejecución: ambos nulos.
        assert!(is_due(&flow(None, None), now));
        assert!(!is_due(&flow(None, Some(now)), now));
    }

    #[test]
    fn five_field_cron_with_timezone() {
        let after = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        // 03:00 en Madrid (CEST, UTC+2) = 01:00 UTC.
        let next = next_run("0 3 * * *", Some("Europe/Madrid"), after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 11, 1, 0, 0).unwrap());
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let after = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let next = next_run("0 3 * * *", Some("Not/AZone"), after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap());
    }

    #[test]
    fn invalid_cron_is_config_error() {
        let after = Utc::now();
        assert!(matches!(next_run("not a cron", None, after), Err(EngineError::Config(_))));
    }
}
