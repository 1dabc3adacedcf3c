//! Propiedad de refresh atómico del catálogo: mientras un refresh está en
//! curso, todo lector concurrente observa el snapshot anterior completo o el
//! nuevo completo, nunca uno parcial.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crm_core::catalog::{Catalog, CatalogSnapshot, MetadataSource};
use crm_domain::{EngineError, ObjectDef, SharingModel};

const SMALL: usize = 3;
const LARGE: usize = 24;

struct AlternatingSource {
    generation: AtomicUsize,
}

fn object(n: usize) -> ObjectDef {
    ObjectDef { api_name: format!("object_{n}"),
                label: format!("Object {n}"),
                plural_label: format!("Objects {n}"),
                description: None,
                is_custom: true,
                sharing_model: SharingModel::Private,
                app_id: None,
                table_type: None,
                list_fields: vec![],
                icon: None,
                fields: Default::default() }
}

impl MetadataSource for AlternatingSource {
    fn load_snapshot(&self) -> Result<CatalogSnapshot, EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let size = if generation % 2 == 0 { SMALL } else { LARGE };
        let mut snapshot = CatalogSnapshot::default();
        for n in 0..size {
            // Construcción lenta a propósito: maximiza la ventana en la que
            // un swap no atómico expondría un snapshot a medio armar.
            snapshot.objects.insert(format!("object_{n}"), object(n));
            thread::sleep(Duration::from_micros(200));
        }
        Ok(snapshot)
    }
}

#[test]
fn readers_never_observe_partial_snapshots() {
    let source = Arc::new(AlternatingSource { generation: AtomicUsize::new(0) });
    let catalog = Arc::new(Catalog::new(source).expect("initial load"));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let catalog = Arc::clone(&catalog);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut observations = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let snapshot = catalog.snapshot().expect("read");
                let count = snapshot.objects.len();
                assert!(count == SMALL || count == LARGE, "partial snapshot visible: {count} objects");
                observations += 1;
            }
            observations
        }));
    }

    for _ in 0..10 {
        catalog.refresh_cache().expect("refresh");
    }
    // Y un par de recargas perezosas por invalidación.
    for _ in 0..3 {
        catalog.invalidate_cache();
        let _ = catalog.snapshot().expect("lazy reload");
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        let observations = reader.join().expect("reader thread");
        assert!(observations > 0, "reader must have observed snapshots");
    }
}
