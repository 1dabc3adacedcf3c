//! Planeamiento de rollups: qué agregados recomputar ante el cambio de un
//! registro hijo y el SQL que los recalcula.
//!
//! El filtro configurado por el administrador es texto que se interpola en el
//! WHERE; antes de interpolarse se valida contra una denylist de substrings
//! peligrosos. Un filtro rechazado aborta el recompute con error, nunca
//! ejecuta la consulta.

use crm_domain::{EngineError, RollupConfig, RollupFunction};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::CatalogSnapshot;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("ident regex"));

const DENYLIST: [&str; 18] = [";", "--", "/*", "*/", "drop ", "delete ", "insert ", "update ", "alter ", "create ",
                              "truncate ", "grant ", "union", "sleep(", "pg_sleep", "information_schema", "copy ",
                              "load_file"];

/// Plan de recompute de un rollup concreto: el padre a actualizar y el SQL
/// agregado listo para bindear el id del padre como `$1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupPlan {
    pub parent_object: String,
    pub parent_field: String,
    pub child_object: String,
    pub relationship_field: String,
    pub aggregate_sql: String,
    pub function: RollupFunction,
}

/// Valida el texto de filtro contra la denylist (case-insensitive).
pub fn validate_filter(filter: &str) -> Result<(), EngineError> {
    let lowered = filter.to_ascii_lowercase();
    for needle in DENYLIST {
        if lowered.contains(needle) {
            return Err(EngineError::validation("filter",
                                               format!("rollup filter contains forbidden fragment '{}'",
                                                       needle.trim())));
        }
    }
    Ok(())
}

fn checked_ident(name: &str, what: &str) -> Result<(), EngineError> {
    if IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::validation(what, format!("'{name}' is not a valid identifier")))
    }
}

/// SQL agregado para un rollup. COUNT agrega sobre `id`; el resto exige
/// `summary_field`. Los registros soft-deleted quedan siempre excluidos.
pub fn aggregate_sql(config: &RollupConfig) -> Result<String, EngineError> {
    checked_ident(&config.summary_object, "summary_object")?;
    checked_ident(&config.relationship_field, "relationship_field")?;
    let column = match config.function {
        RollupFunction::Count => "id".to_string(),
        _ => {
            let col = config.summary_field
                            .as_deref()
                            .ok_or_else(|| EngineError::validation("summary_field",
                                                                   "aggregate requires a summary_field"))?;
            checked_ident(col, "summary_field")?;
            col.to_string()
        }
    };
    // Cast uniforme: COUNT devuelve bigint y el lector espera double.
    let mut sql = format!("SELECT {}({})::double precision AS agg FROM {} WHERE {} = $1 AND is_deleted = false",
                          config.function.sql_name(),
                          column,
                          config.summary_object,
                          config.relationship_field);
    if let Some(filter) = config.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        validate_filter(filter)?;
        sql.push_str(&format!(" AND ({filter})"));
    }
    Ok(sql)
}

/// Enumera los planes de recompute afectados por un cambio en `child_object`:
/// todo campo RollupSummary de cualquier objeto cuyo `summary_object` sea el
/// hijo (case-insensitive).
pub fn plans_for_child(snapshot: &CatalogSnapshot, child_object: &str) -> Result<Vec<RollupPlan>, EngineError> {
    let mut plans = Vec::new();
    for parent in snapshot.objects.values() {
        for field in parent.fields.values() {
            let Some(config) = field.rollup_config.as_ref() else { continue };
            if !config.summary_object.eq_ignore_ascii_case(child_object) {
                continue;
            }
            plans.push(RollupPlan { parent_object: parent.api_name.clone(),
                                    parent_field: field.api_name.clone(),
                                    child_object: config.summary_object.clone(),
                                    relationship_field: config.relationship_field.clone(),
                                    aggregate_sql: aggregate_sql(config)?,
                                    function: config.function });
        }
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(function: RollupFunction, filter: Option<&str>) -> RollupConfig {
        RollupConfig { summary_object: "line_item".into(),
                       relationship_field: "invoice_id".into(),
                       summary_field: Some("amount".into()),
                       function,
                       filter: filter.map(str::to_string) }
    }

    #[test]
    fn builds_aggregate_sql() {
        let sql = aggregate_sql(&config(RollupFunction::Sum, None)).unwrap();
        assert_eq!(sql,
                   "SELECT SUM(amount)::double precision AS agg FROM line_item \
                    WHERE invoice_id = $1 AND is_deleted = false");
        let counted = aggregate_sql(&RollupConfig { summary_field: None,
                                                    ..config(RollupFunction::Count, None) }).unwrap();
        assert!(counted.starts_with("SELECT COUNT(id)"));
    }

    #[test]
    fn filter_is_appended_after_denylist_check() {
        let sql = aggregate_sql(&config(RollupFunction::Sum, Some("status = 'billed'"))).unwrap();
        assert!(sql.ends_with("AND (status = 'billed')"));
        for bad in ["amount > 0; DROP TABLE x", "1=1 UNION SELECT 1", "sleep(10) > 0", "a -- b",
                    "exists (select 1 from information_schema.tables)"] {
            assert!(aggregate_sql(&config(RollupFunction::Sum, Some(bad))).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn sum_without_summary_field_fails() {
        let cfg = RollupConfig { summary_field: None,
                                 ..config(RollupFunction::Sum, None) };
        assert!(aggregate_sql(&cfg).is_err());
    }
}
