//! Validación y reescritura de SQL analítico emitido por administradores.
//!
//! Alcance deliberadamente acotado (no es un parser SQL completo):
//! - Sólo se admite un único statement SELECT.
//! - Se rechazan referencias a tablas fuera del catálogo (y a tablas de
//!   sistema para usuarios no administradores).
//! - Para SELECTs de una sola tabla contra objetos con `owner_id`, se inyecta
//!   el filtro `owner_id = $user` en el WHERE salvo que el usuario sea
//!   System Admin. Los SELECT con JOIN no se reescriben.

use crm_domain::{EngineError, UserContext};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::CatalogSnapshot;

static FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bfrom\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:as\s+)?([A-Za-z_][A-Za-z0-9_]*))?")
                  .expect("from regex"));
static JOIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjoin\b").expect("join regex"));
static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bwhere\b").expect("where regex"));
static TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(group\s+by|order\s+by|having|limit|offset)\b").expect("tail regex"));
static FORBIDDEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(pg_\w+|information_schema)\b").expect("forbidden regex"));

pub struct SecurityValidator;

impl SecurityValidator {
    /// Valida el SQL y devuelve la versión reescrita (o la original si no
    /// corresponde inyección).
    pub fn validate_and_rewrite(sql: &str, user: &UserContext, snapshot: &CatalogSnapshot)
                                -> Result<String, EngineError> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(EngineError::validation("sql", "empty statement"));
        }
        // Multi-statement: cualquier ';' restante tras quitar el final.
        if trimmed.contains(';') {
            return Err(EngineError::validation("sql", "multiple statements are not allowed"));
        }
        if !trimmed[..6.min(trimmed.len())].eq_ignore_ascii_case("select") {
            return Err(EngineError::validation("sql", "only SELECT statements are allowed"));
        }
        if FORBIDDEN_RE.is_match(trimmed) {
            return Err(EngineError::validation("sql", "reference to a forbidden schema object"));
        }

        let captures = FROM_RE.captures(trimmed)
                              .ok_or_else(|| EngineError::validation("sql", "missing FROM clause"))?;
        let table = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if table.starts_with("_system_") && !user.is_system_admin {
            return Err(EngineError::permission("read", table));
        }
        if !table.starts_with("_system_") && snapshot.object(table).is_none() {
            return Err(EngineError::validation("sql", format!("unknown table '{table}'")));
        }

        // Multi-tabla: se valida pero no se reescribe (los JOIN quedan bajo
        // responsabilidad del administrador que los emite).
        if JOIN_RE.is_match(trimmed) || user.is_system_admin || table.starts_with("_system_") {
            return Ok(trimmed.to_string());
        }

        // El grupo de alias puede capturar la palabra clave siguiente
        // (WHERE, ORDER, ...); en ese caso no hay alias real.
        const KEYWORDS: [&str; 10] = ["where", "group", "order", "having", "limit", "offset", "join", "on",
                                      "union", "inner"];
        let alias = captures.get(2)
                            .map(|m| m.as_str().to_string())
                            .filter(|a| !KEYWORDS.contains(&a.to_ascii_lowercase().as_str()));
        let qualifier = alias.unwrap_or_else(|| table.to_string());
        let owner_filter = format!("{qualifier}.owner_id = '{}'", user.id);

        if let Some(m) = WHERE_RE.find(trimmed) {
            // WHERE existente: se envuelve la condición original y se agrega
            // el filtro con AND, respetando GROUP BY / ORDER BY / LIMIT.
            let before = &trimmed[..m.start()];
            let after_where = &trimmed[m.end()..];
            let (condition, tail) = match TAIL_RE.find(after_where) {
                Some(t) => (&after_where[..t.start()], &after_where[t.start()..]),
                None => (after_where, ""),
            };
            Ok(format!("{}WHERE ({}) AND {} {}", before, condition.trim(), owner_filter, tail).trim_end()
                                                                                              .to_string())
        } else {
            match TAIL_RE.find(trimmed) {
                Some(t) => {
                    let (head, tail) = trimmed.split_at(t.start());
                    Ok(format!("{} WHERE {} {}", head.trim_end(), owner_filter, tail))
                }
                None => Ok(format!("{trimmed} WHERE {owner_filter}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::{ObjectDef, SharingModel};
    use uuid::Uuid;

    fn snapshot_with(objects: &[&str]) -> CatalogSnapshot {
        let mut snap = CatalogSnapshot::default();
        for name in objects {
            let obj = ObjectDef { api_name: name.to_string(),
                                  label: name.to_string(),
                                  plural_label: format!("{name}s"),
                                  description: None,
                                  is_custom: true,
                                  sharing_model: SharingModel::Private,
                                  app_id: None,
                                  table_type: None,
                                  list_fields: vec![],
                                  icon: None,
                                  fields: Default::default() };
            snap.objects.insert(name.to_string(), obj);
        }
        snap
    }

    fn user(admin: bool) -> UserContext {
        UserContext { id: Uuid::from_u128(42),
                      username: "ada".into(),
                      profile_id: None,
                      permission_set_ids: vec![],
                      role_id: None,
                      is_system_admin: admin }
    }

    #[test]
    fn injects_owner_filter_for_non_admin() {
        let snap = snapshot_with(&["ticket"]);
        let sql = SecurityValidator::validate_and_rewrite("SELECT name FROM ticket WHERE priority = 'High'",
                                                          &user(false),
                                                          &snap).unwrap();
        assert!(sql.contains("(priority = 'High') AND ticket.owner_id ="), "got: {sql}");

        let no_where =
            SecurityValidator::validate_and_rewrite("SELECT name FROM ticket ORDER BY name", &user(false), &snap)
                .unwrap();
        assert!(no_where.contains("WHERE ticket.owner_id ="), "got: {no_where}");
        assert!(no_where.ends_with("ORDER BY name"), "got: {no_where}");
    }

    #[test]
    fn admin_sql_passes_untouched() {
        let snap = snapshot_with(&["ticket"]);
        let sql = "SELECT name FROM ticket WHERE priority = 'High'";
        assert_eq!(SecurityValidator::validate_and_rewrite(sql, &user(true), &snap).unwrap(), sql);
    }

    #[test]
    fn rejects_non_select_and_multi_statement() {
        let snap = snapshot_with(&["ticket"]);
        assert!(SecurityValidator::validate_and_rewrite("DELETE FROM ticket", &user(false), &snap).is_err());
        assert!(SecurityValidator::validate_and_rewrite("SELECT 1; SELECT 2", &user(false), &snap).is_err());
        assert!(SecurityValidator::validate_and_rewrite("SELECT * FROM information_schema.tables",
                                                        &user(false),
                                                        &snap).is_err());
        assert!(SecurityValidator::validate_and_rewrite("SELECT * FROM unknown_table", &user(false), &snap).is_err());
        assert!(SecurityValidator::validate_and_rewrite("SELECT * FROM _system_user", &user(false), &snap).is_err());
    }

    #[test]
    fn joins_are_not_rewritten() {
        let snap = snapshot_with(&["ticket", "account"]);
        let sql = "SELECT t.name FROM ticket t JOIN account a ON a.id = t.account_id";
        assert_eq!(SecurityValidator::validate_and_rewrite(sql, &user(false), &snap).unwrap(), sql);
    }
}
