//! Ejecutor de rollups: recomputa los agregados de los padres afectados por
//! el cambio de un hijo, dentro de la misma transacción que la mutación.
//!
//! El recompute es idempotente: recalcular sobre un conjunto de hijos sin
//! cambios produce el mismo valor. Para updates, el motor invoca con el
//! registro nuevo y también con el viejo, de modo que un re-parenting deja
//! consistentes a ambos padres.

use std::sync::Arc;

use diesel::prelude::*;
use diesel::sql_types::{Double, Nullable, Uuid as SqlUuid};
use log::debug;
use uuid::Uuid;

use crm_core::catalog::Catalog;
use crm_core::rollup::{plans_for_child, RollupPlan};
use crm_domain::{EngineError, SObject};
use crm_persistence::error::PersistenceError;
use crm_persistence::schema_manager::ensure_user_ident;

#[derive(QueryableByName)]
struct AggRow {
    #[diesel(sql_type = Nullable<Double>)]
    agg: Option<f64>,
}

pub struct RollupEngine {
    catalog: Arc<Catalog>,
}

impl RollupEngine {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Recomputa todos los rollups que agregan sobre `child_object`,
    /// extrayendo el id del padre desde el `relationship_field` del registro.
    pub fn process_rollups(&self, conn: &mut PgConnection, child_object: &str, record: &SObject)
                           -> Result<(), EngineError> {
        let snapshot = self.catalog.snapshot()?;
        let plans = plans_for_child(&snapshot, child_object)?;
        for plan in &plans {
            let Some(parent_id) = record.get_uuid(&plan.relationship_field) else { continue };
            self.recompute(conn, plan, parent_id)?;
        }
        Ok(())
    }

    /// Recompute de un plan concreto para un padre concreto.
    pub fn recompute(&self, conn: &mut PgConnection, plan: &RollupPlan, parent_id: Uuid) -> Result<(), EngineError> {
        let row: AggRow = diesel::sql_query(&plan.aggregate_sql).bind::<SqlUuid, _>(parent_id)
                                                                .get_result(conn)
                                                                .map_err(PersistenceError::from)?;
        // Defaults ante conjunto vacío: COUNT/SUM/AVG = 0, MIN/MAX = null.
        let value = match row.agg {
            Some(v) => Some(v),
            None if plan.function.zero_default() => Some(0.0),
            None => None,
        };
        let parent_table = plan.parent_object.to_ascii_lowercase();
        ensure_user_ident(&parent_table)?;
        ensure_user_ident(&plan.parent_field)?;
        let sql = format!("UPDATE {parent_table} SET {} = $1 WHERE id = $2", plan.parent_field);
        diesel::sql_query(sql).bind::<Nullable<Double>, _>(value)
                              .bind::<SqlUuid, _>(parent_id)
                              .execute(conn)
                              .map_err(PersistenceError::from)?;
        debug!("rollup: {}.{} for parent {parent_id} -> {value:?}", plan.parent_object, plan.parent_field);
        Ok(())
    }
}
