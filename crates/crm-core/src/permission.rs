//! Mitad pura del motor de permisos: combinación OR de filas, niveles de
//! acceso y jerarquía de roles cacheada con guardia de ciclos.
//!
//! La decisión completa (orden admin → objeto → registro) vive en la capa de
//! orquestación, que consulta el storage; aquí no hay I/O.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crm_domain::{FieldPermFlags, ObjectPermFlags, SObject, SharingRule};
use uuid::Uuid;

use crate::formula::{FormulaContext, FormulaEngine};

/// OR bit a bit de todas las filas aplicables. `None` si no hay ninguna fila
/// (sin fila ⇒ denegar).
pub fn effective_object_flags(rows: &[ObjectPermFlags]) -> Option<ObjectPermFlags> {
    rows.iter().copied().reduce(ObjectPermFlags::or_with)
}

pub fn effective_field_flags(rows: &[FieldPermFlags]) -> Option<FieldPermFlags> {
    rows.iter().copied().reduce(FieldPermFlags::or_with)
}

/// Evalúa el criterio de una regla de compartición sobre el registro.
/// Criterio vacío ⇒ la regla aplica a todos los registros del objeto; un
/// criterio que no evalúa se trata como no-match (la regla nunca amplía
/// acceso por error de fórmula).
pub fn sharing_rule_matches(rule: &SharingRule, record: &SObject) -> bool {
    match rule.criteria.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(expr) => {
            let ctx = FormulaContext::for_record(record);
            FormulaEngine::evaluate_condition(expr, &ctx).unwrap_or(false)
        }
    }
}

/// Cache de jerarquía de roles: mapa role_id → parent_role_id bajo RwLock.
/// Se recarga completo vía `replace` (RefreshRoleHierarchy).
#[derive(Default)]
pub struct RoleHierarchy {
    parents: RwLock<HashMap<Uuid, Option<Uuid>>>,
}

impl RoleHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reemplaza el mapa completo (swap bajo write-lock).
    pub fn replace(&self, parents: HashMap<Uuid, Option<Uuid>>) {
        if let Ok(mut guard) = self.parents.write() {
            *guard = parents;
        }
    }

    /// Ancestros estrictos de `role_id`, caminando padres. La caminata
    /// termina ante padre nulo o id repetido (guardia de ciclos).
    pub fn ancestors(&self, role_id: Uuid) -> Vec<Uuid> {
        let Ok(guard) = self.parents.read() else { return Vec::new() };
        let mut seen: HashSet<Uuid> = HashSet::new();
        seen.insert(role_id);
        let mut out = Vec::new();
        let mut current = role_id;
        while let Some(Some(parent)) = guard.get(&current).copied() {
            if !seen.insert(parent) {
                break;
            }
            out.push(parent);
            current = parent;
        }
        out
    }

    /// ¿`candidate` es ancestro estricto del rol del dueño? La jerarquía sólo
    /// concede lectura hacia abajo, nunca escritura.
    pub fn is_strict_ancestor(&self, candidate: Uuid, owner_role: Uuid) -> bool {
        candidate != owner_role && self.ancestors(owner_role).contains(&candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::AccessLevel;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn or_merge_of_permission_rows() {
        let read_only = ObjectPermFlags { can_read: true,
                                          ..Default::default() };
        let edit_only = ObjectPermFlags { can_edit: true,
                                          ..Default::default() };
        let merged = effective_object_flags(&[read_only, edit_only]).unwrap();
        assert!(merged.can_read && merged.can_edit);
        assert!(!merged.can_delete);
        assert!(effective_object_flags(&[]).is_none());
    }

    #[test]
    fn ancestor_walk_terminates_on_cycle() {
        let h = RoleHierarchy::new();
        // ceo → vp → manager → rep, y un ciclo artificial x ↔ y.
        let (ceo, vp, manager, rep) = (id(1), id(2), id(3), id(4));
        let (x, y) = (id(10), id(11));
        let mut map = HashMap::new();
        map.insert(ceo, None);
        map.insert(vp, Some(ceo));
        map.insert(manager, Some(vp));
        map.insert(rep, Some(manager));
        map.insert(x, Some(y));
        map.insert(y, Some(x));
        h.replace(map);

        assert_eq!(h.ancestors(rep), vec![manager, vp, ceo]);
        assert!(h.is_strict_ancestor(manager, rep));
        assert!(h.is_strict_ancestor(ceo, rep));
        assert!(!h.is_strict_ancestor(rep, rep));
        assert!(!h.is_strict_ancestor(rep, manager));
        // El ciclo no cuelga y devuelve una cadena finita.
        assert_eq!(h.ancestors(x), vec![y]);
    }

    #[test]
    fn sharing_rule_criteria() {
        let mut rec = SObject::new();
        rec.set("region", "EMEA");
        let rule = SharingRule { id: Uuid::new_v4(),
                                 object_api_name: "account".into(),
                                 criteria: Some("region == 'EMEA'".into()),
                                 access_level: AccessLevel::Read,
                                 share_with_role_id: None,
                                 share_with_user_id: Some(Uuid::new_v4()),
                                 share_with_group_id: None };
        assert!(sharing_rule_matches(&rule, &rec));
        rec.set("region", "APAC");
        assert!(!sharing_rule_matches(&rule, &rec));
        let open = SharingRule { criteria: None,
                                 ..rule };
        assert!(sharing_rule_matches(&open, &rec));
    }

    #[test]
    fn access_level_semantics() {
        use crm_domain::Operation;
        assert!(AccessLevel::Edit.allows(Operation::Read));
        assert!(AccessLevel::Edit.allows(Operation::Edit));
        assert!(AccessLevel::Read.allows(Operation::Read));
        assert!(!AccessLevel::Read.allows(Operation::Edit));
        assert!(!AccessLevel::Edit.allows(Operation::Delete));
    }
}
