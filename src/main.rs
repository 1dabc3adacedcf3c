//! Demo del motor: define un par de objetos (factura + items con rollup),
//! registra un flujo de alerta, hace un round-trip de CRUD y deja los workers
//! publicando eventos.
//!
//! Requiere `DATABASE_URL` (ver `.env`); las migraciones corren solas al
//! armar el pool.

use std::sync::Arc;

use log::info;
use serde_json::json;
use uuid::Uuid;

use crm_adapters::{HttpWebhookClient, LogEmailSender, SaltedSha256Hasher};
use crm_domain::{FieldDef, FieldType, FlowDef, FlowStatus, FlowType, ObjectDef, RollupConfig, RollupFunction,
                 SObject, SharingModel, TriggerType, UserContext};
use crm_engine::EngineBuilder;
use crm_persistence::config::DbConfig;
use crm_persistence::flow_store;
use crm_persistence::tx::build_pool;

fn invoice_schema() -> ObjectDef {
    let mut invoice = ObjectDef { api_name: "demo_invoice".into(),
                                  label: "Invoice".into(),
                                  plural_label: "Invoices".into(),
                                  description: Some("Factura de demo".into()),
                                  is_custom: true,
                                  sharing_model: SharingModel::PublicReadWrite,
                                  app_id: None,
                                  table_type: None,
                                  list_fields: vec!["name".into(), "total_amount".into()],
                                  icon: None,
                                  fields: Default::default() };
    let mut name = FieldDef::new("name", "Name", FieldType::Text);
    name.required = true;
    name.is_name_field = true;
    invoice.add_field(name);
    let mut total = FieldDef::new("total_amount", "Total", FieldType::RollupSummary);
    total.rollup_config = Some(RollupConfig { summary_object: "demo_line_item".into(),
                                              relationship_field: "invoice_id".into(),
                                              summary_field: Some("amount".into()),
                                              function: RollupFunction::Sum,
                                              filter: None });
    invoice.add_field(total);
    invoice
}

fn line_item_schema() -> ObjectDef {
    let mut item = ObjectDef { api_name: "demo_line_item".into(),
                               label: "Line Item".into(),
                               plural_label: "Line Items".into(),
                               description: None,
                               is_custom: true,
                               sharing_model: SharingModel::PublicReadWrite,
                               app_id: None,
                               table_type: None,
                               list_fields: vec!["amount".into()],
                               icon: None,
                               fields: Default::default() };
    let mut invoice_ref = FieldDef::new("invoice_id", "Invoice", FieldType::Lookup);
    invoice_ref.reference_to = vec!["demo_invoice".into()];
    invoice_ref.required = true;
    invoice_ref.is_master_detail = true;
    invoice_ref.delete_rule = Some(crm_domain::DeleteRule::Cascade);
    item.add_field(invoice_ref);
    let mut amount = FieldDef::new("amount", "Amount", FieldType::Currency);
    amount.min_value = Some(0.0);
    item.add_field(amount);
    item
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    crm_persistence::init_dotenv();
    let db = DbConfig::from_env();
    let pool = build_pool(&db.url, db.min_connections, db.max_connections)?;

    let engine = EngineBuilder::new(pool,
                                    Arc::new(LogEmailSender::new()),
                                    Arc::new(HttpWebhookClient::new()?),
                                    Arc::new(SaltedSha256Hasher::new())).build()?;

    // Esquema de demo; en re-corridas los objetos ya existen en el catálogo.
    if engine.catalog.get_schema("demo_invoice")?.is_none() {
        engine.schema_manager.create_table_from_definition(&invoice_schema())?;
        engine.schema_manager.create_table_from_definition(&line_item_schema())?;
        engine.invalidate_metadata();
    }

    // Flujo de alerta: email al crear un item de monto alto.
    let flows = engine.catalog.get_flows()?;
    if !flows.iter().any(|f| f.name == "demo_high_amount_alert") {
        let mut conn = engine.provider.connection()?;
        flow_store::insert_flow(&mut conn,
                                &FlowDef { id: Uuid::new_v4(),
                                           name: "demo_high_amount_alert".into(),
                                           trigger_object: "demo_line_item".into(),
                                           trigger_type: TriggerType::AfterCreate,
                                           trigger_condition: Some("amount >= 1000".into()),
                                           flow_type: FlowType::Simple,
                                           action_type: Some("SendEmail".into()),
                                           action_config: Some(json!({
                                               "to": "finance@example.test",
                                               "subject": "=CONCAT('High line item: ', amount)",
                                               "body": "Revisar la factura",
                                           })),
                                           status: FlowStatus::Active,
                                           schedule: None,
                                           schedule_timezone: None,
                                           next_run_at: None,
                                           last_run_at: None,
                                           is_running: false })?;
        engine.invalidate_metadata();
    }

    engine.start_workers();

    let admin = UserContext::system();
    let mut invoice = SObject::new();
    invoice.set("name", "INV-DEMO");
    let invoice = engine.records.insert(&admin, "demo_invoice", invoice)?;
    let invoice_id = invoice.id().expect("inserted invoice id");

    for amount in [250.0, 1500.0] {
        let mut item = SObject::new();
        item.set("invoice_id", invoice_id);
        item.set("amount", amount);
        engine.records.insert(&admin, "demo_line_item", item)?;
    }

    let reloaded = engine.records.get(&admin, "demo_invoice", invoice_id)?;
    info!("invoice {} total_amount = {:?}",
          invoice_id,
          reloaded.get("total_amount").map(|v| v.to_display_string()));

    // Deja que el worker publique los eventos after (dispara el flujo de
    // email) y cierra ordenado.
    std::thread::sleep(std::time::Duration::from_millis(1200));
    engine.stop_workers();
    Ok(())
}
