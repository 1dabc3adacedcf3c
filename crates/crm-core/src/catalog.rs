//! Catálogo de metadatos: snapshot coherente en memoria con swap atómico.
//!
//! Contrato (ver diseño):
//! - Los lectores observan siempre un snapshot completo: el anterior o el
//!   nuevo, nunca uno parcial. El swap ocurre sólo tras una carga exitosa.
//! - `refresh_cache` falla ante cualquier error de lectura crítica (objetos,
//!   campos, flujos) y deja intacto el snapshot previo.
//! - `invalidate_cache` marca el snapshot como viejo; la próxima lectura
//!   dispara un refresh perezoso bajo double-checked locking.
//! - Las claves se normalizan a minúsculas para matching case-insensitive; la
//!   grafía original vive dentro de cada definición.
//!
//! Concurrencia: un único RwLock sobre `Arc<CatalogSnapshot>`; las lecturas
//! pagan un read-lock corto y un clone de Arc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use uuid::Uuid;

use crm_domain::{AutoNumberDef, EngineError, FlowDef, FlowStepDef, ObjectDef, SharingRule, TriggerType,
                 ValidationRuleDef};

/// Snapshot inmutable del catálogo. Los mapas por objeto usan api_name en
/// minúsculas como clave.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub objects: HashMap<String, ObjectDef>,
    pub flows: Vec<FlowDef>,
    pub flow_steps: HashMap<Uuid, Vec<FlowStepDef>>,
    pub validation_rules: HashMap<String, Vec<ValidationRuleDef>>,
    pub auto_numbers: HashMap<String, Vec<AutoNumberDef>>,
    pub sharing_rules: HashMap<String, Vec<SharingRule>>,
}

impl CatalogSnapshot {
    pub fn object(&self, api_name: &str) -> Option<&ObjectDef> {
        self.objects.get(&api_name.to_ascii_lowercase())
    }

    /// Pasos de un flujo multistep, ya ordenados por `step_order` (mínimo
    /// primero, id como desempate estable).
    pub fn steps_for_flow(&self, flow_id: Uuid) -> &[FlowStepDef] {
        self.flow_steps.get(&flow_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_for(&self, object: &str) -> &[ValidationRuleDef] {
        self.validation_rules
            .get(&object.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn auto_numbers_for(&self, object: &str) -> &[AutoNumberDef] {
        self.auto_numbers
            .get(&object.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn sharing_rules_for(&self, object: &str) -> &[SharingRule] {
        self.sharing_rules
            .get(&object.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn scheduled_flows(&self) -> impl Iterator<Item = &FlowDef> {
        self.flows.iter().filter(|f| f.trigger_type == TriggerType::Scheduled)
    }
}

/// Fuente de metadatos. La implementación Postgres carga todas las tablas de
/// sistema; los fallos en datos no críticos por objeto (reglas, numeraciones)
/// deben resolverse adentro con default vacío, nunca abortando la carga.
pub trait MetadataSource: Send + Sync {
    fn load_snapshot(&self) -> Result<CatalogSnapshot, EngineError>;
}

/// Catálogo con refresh atómico y invalidación perezosa.
pub struct Catalog {
    source: Arc<dyn MetadataSource>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    stale: AtomicBool,
}

impl Catalog {
    /// Construye el catálogo cargando un snapshot inicial. Falla si la carga
    /// crítica falla (no hay snapshot previo al que caer).
    pub fn new(source: Arc<dyn MetadataSource>) -> Result<Self, EngineError> {
        let initial = source.load_snapshot()?;
        Ok(Self { source,
                  snapshot: RwLock::new(Arc::new(initial)),
                  stale: AtomicBool::new(false) })
    }

    /// Variante para arranque sin storage listo: snapshot vacío marcado stale,
    /// la primera lectura refresca.
    pub fn new_stale(source: Arc<dyn MetadataSource>) -> Self {
        Self { source,
               snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
               stale: AtomicBool::new(true) }
    }

    /// Snapshot vigente. Si hay invalidación pendiente aplica double-checked
    /// locking: re-verifica el flag bajo el write-lock antes de recargar.
    pub fn snapshot(&self) -> Result<Arc<CatalogSnapshot>, EngineError> {
        if !self.stale.load(Ordering::Acquire) {
            let guard = self.snapshot
                            .read()
                            .map_err(|_| EngineError::Internal("catalog lock poisoned".into()))?;
            return Ok(Arc::clone(&guard));
        }
        let mut guard = self.snapshot
                            .write()
                            .map_err(|_| EngineError::Internal("catalog lock poisoned".into()))?;
        if self.stale.load(Ordering::Acquire) {
            debug!("catalog: lazy refresh after invalidation");
            let fresh = self.source.load_snapshot()?;
            *guard = Arc::new(fresh);
            self.stale.store(false, Ordering::Release);
        }
        Ok(Arc::clone(&guard))
    }

    /// Recarga completa. El snapshot previo sólo se reemplaza si la carga
    /// entera fue exitosa.
    pub fn refresh_cache(&self) -> Result<(), EngineError> {
        let fresh = match self.source.load_snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("catalog: refresh failed, keeping previous snapshot: {e}");
                return Err(e);
            }
        };
        let mut guard = self.snapshot
                            .write()
                            .map_err(|_| EngineError::Internal("catalog lock poisoned".into()))?;
        *guard = Arc::new(fresh);
        self.stale.store(false, Ordering::Release);
        debug!("catalog: snapshot swapped");
        Ok(())
    }

    /// Marca el snapshot como viejo. Toda mutación de metadatos debe llamar
    /// aquí tras commitear.
    pub fn invalidate_cache(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn get_schema(&self, api_name: &str) -> Result<Option<ObjectDef>, EngineError> {
        Ok(self.snapshot()?.object(api_name).cloned())
    }

    pub fn get_field(&self, object: &str, field: &str) -> Result<Option<crm_domain::FieldDef>, EngineError> {
        Ok(self.snapshot()?.object(object).and_then(|o| o.field(field)).cloned())
    }

    pub fn get_flows(&self) -> Result<Vec<FlowDef>, EngineError> {
        Ok(self.snapshot()?.flows.clone())
    }

    pub fn get_validation_rules(&self, object: &str) -> Result<Vec<ValidationRuleDef>, EngineError> {
        Ok(self.snapshot()?.rules_for(object).to_vec())
    }

    pub fn get_auto_numbers(&self, object: &str) -> Result<Vec<AutoNumberDef>, EngineError> {
        Ok(self.snapshot()?.auto_numbers_for(object).to_vec())
    }

    pub fn get_sharing_rules(&self, object: &str) -> Result<Vec<SharingRule>, EngineError> {
        Ok(self.snapshot()?.sharing_rules_for(object).to_vec())
    }

    pub fn get_scheduled_flows(&self) -> Result<Vec<FlowDef>, EngineError> {
        Ok(self.snapshot()?.scheduled_flows().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        loads: AtomicUsize,
        fail: AtomicBool,
    }

    impl MetadataSource for CountingSource {
        fn load_snapshot(&self) -> Result<CatalogSnapshot, EngineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Fatal("schemas table unreadable".into()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut snap = CatalogSnapshot::default();
            let obj = ObjectDef { api_name: "Ticket".into(),
                                  label: "Ticket".into(),
                                  plural_label: "Tickets".into(),
                                  description: None,
                                  is_custom: true,
                                  sharing_model: crm_domain::SharingModel::Private,
                                  app_id: None,
                                  table_type: None,
                                  list_fields: vec![],
                                  icon: None,
                                  fields: Default::default() };
            snap.objects.insert("ticket".into(), obj);
            Ok(snap)
        }
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0),
                                               fail: AtomicBool::new(false) });
        let catalog = Catalog::new(Arc::clone(&source) as Arc<dyn MetadataSource>).unwrap();
        assert!(catalog.get_schema("TICKET").unwrap().is_some());

        source.fail.store(true, Ordering::SeqCst);
        assert!(catalog.refresh_cache().is_err());
        // El snapshot previo sigue sirviendo lecturas.
        assert!(catalog.get_schema("ticket").unwrap().is_some());
    }

    #[test]
    fn invalidate_triggers_single_lazy_reload() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0),
                                               fail: AtomicBool::new(false) });
        let catalog = Catalog::new(Arc::clone(&source) as Arc<dyn MetadataSource>).unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        catalog.invalidate_cache();
        catalog.get_schema("ticket").unwrap();
        catalog.get_schema("ticket").unwrap();
        // Una única recarga pese a dos lecturas tras invalidar.
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn case_insensitive_lookup_preserves_original_case() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0),
                                               fail: AtomicBool::new(false) });
        let catalog = Catalog::new(source as Arc<dyn MetadataSource>).unwrap();
        let schema = catalog.get_schema("TiCkEt").unwrap().unwrap();
        assert_eq!(schema.api_name, "Ticket");
    }
}
