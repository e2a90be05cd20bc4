//! Lenient field lookup over model JSON.
//!
//! The model is asked for French keys but regularly answers with renamed or
//! English keys, numbers as strings ("1 200,50 €"), and teeth as free text.
//! Every reader here takes a list of accepted key aliases and never fails;
//! an unusable value is simply absent.

use serde_json::{Map, Value};

/// Accepted key aliases, the key requested by the prompt first.
pub(crate) mod keys {
    pub const PATIENT: &[&str] = &["patient", "nom_patient", "patientName", "patient_name"];
    pub const DATE_QUOTE: &[&str] = &["date_devis", "dateQuote", "date_quote", "date"];
    pub const GENERAL_STATE: &[&str] = &["etat_general", "generalState", "general_state"];
    pub const PLAIN_SUMMARY: &[&str] = &[
        "resume_langage_clair",
        "plainSummary",
        "plain_summary",
        "resume",
    ];
    pub const TITLE: &[&str] = &["titre", "title"];
    pub const DESCRIPTION: &[&str] = &["description", "desc"];

    pub const PHASES: &[&str] = &["phases"];
    pub const TASKS: &[&str] = &["taches", "tâches", "tasks"];
    pub const SECTIONS: &[&str] = &["sections"];

    pub const NUMBER: &[&str] = &["numero", "numéro", "number", "num"];
    pub const NAME: &[&str] = &["nom", "name", "titre", "title"];
    pub const SESSIONS: &[&str] = &[
        "nombre_seances",
        "nombre_séances",
        "estimatedSessionCount",
        "estimated_session_count",
        "seances",
    ];
    pub const ACT_GROUPS: &[&str] = &["groupes_actes", "actGroups", "act_groups", "groupes"];
    pub const PHASE_TOTAL: &[&str] = &["total_phase", "phaseTotal", "phase_total", "total"];

    pub const GROUP_TYPE: &[&str] = &["type", "categorie", "catégorie", "category"];
    pub const ACTS: &[&str] = &["actes", "acts"];
    pub const SUBTOTAL: &[&str] = &["sous_total", "subtotal", "sub_total", "total"];

    pub const LABEL: &[&str] = &["libelle", "libellé", "label", "nom", "name", "acte"];
    pub const TEETH: &[&str] = &["dents", "teeth", "dent"];
    pub const COST: &[&str] = &["cout", "coût", "cost", "prix", "price"];
    pub const UNIT_COST: &[&str] = &["cout_unitaire", "coût_unitaire", "unitCost", "unit_cost"];
    pub const TOTAL_COST: &[&str] = &["cout_total", "coût_total", "totalCost", "total_cost"];

    pub const TASK_ID: &[&str] = &["id", "identifiant"];
    pub const TASK_PHASE: &[&str] = &["phase", "numero_phase"];
    pub const DURATION: &[&str] = &["duree", "durée", "duration"];
    pub const DURATION_VALUE: &[&str] = &["valeur", "value", "nombre"];
    pub const DURATION_UNIT: &[&str] = &["unite", "unité", "unit"];
    pub const DEPENDENCIES: &[&str] = &["dependances", "dépendances", "dependencies", "depends_on"];
    pub const AFTER: &[&str] = &["apres", "après", "after"];
}

/// First value among `keys` that is present and not null.
pub(crate) fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

pub(crate) fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    lookup(obj, keys).and_then(as_text)
}

pub(crate) fn num_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    lookup(obj, keys).and_then(as_number)
}

pub(crate) fn uint_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    num_field(obj, keys)
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u32)
}

pub(crate) fn array_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    lookup(obj, keys).and_then(Value::as_array)
}

/// Strings, plus numbers and booleans rendered as text. Blank strings are absent.
pub(crate) fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Numbers, or strings holding an amount in French or English notation.
pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Parse "1 200,50 €", "1,200.50", "350" and similar.
pub(crate) fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // Both separators: the last one is the decimal separator
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Tooth numbers from `[11, 12]`, `["11", "12"]` or `"11, 12 et 13"`.
pub(crate) fn teeth_from(value: &Value) -> Vec<u32> {
    let mut teeth: Vec<u32> = match value {
        Value::Array(items) => items.iter().flat_map(teeth_from).collect(),
        Value::Number(n) => n.as_u64().map(|n| n as u32).into_iter().collect(),
        Value::String(s) => s
            .split(|c: char| !c.is_ascii_digit())
            .filter_map(|part| part.parse::<u32>().ok())
            .collect(),
        _ => Vec::new(),
    };
    teeth.retain(|t| (11..=85).contains(t));
    teeth
}

/// Identifier list from an array of ids or a single id.
pub(crate) fn id_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        other => as_text(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_amount_notations() {
        assert_eq!(parse_amount("1 200,50 €"), Some(1200.5));
        assert_eq!(parse_amount("1,200.50"), Some(1200.5));
        assert_eq!(parse_amount("1.200,50"), Some(1200.5));
        assert_eq!(parse_amount("350"), Some(350.0));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn test_lookup_uses_aliases_and_skips_null() {
        let value = json!({"nom": null, "name": "Phase A"});
        let obj = value.as_object().unwrap();
        assert_eq!(str_field(obj, keys::NAME).as_deref(), Some("Phase A"));
    }

    #[test]
    fn test_teeth_from_mixed_inputs() {
        assert_eq!(teeth_from(&json!([11, "12", 13])), vec![11, 12, 13]);
        assert_eq!(teeth_from(&json!("16, 17 et 26")), vec![16, 17, 26]);
        assert_eq!(teeth_from(&json!([3, 99])), Vec::<u32>::new());
    }

    #[test]
    fn test_uint_field_rejects_negative() {
        let value = json!({"numero": -2, "number": "3"});
        let obj = value.as_object().unwrap();
        assert_eq!(uint_field(obj, &["numero"]), None);
        assert_eq!(uint_field(obj, &["number"]), Some(3));
    }

    #[test]
    fn test_id_list_accepts_single_id() {
        assert_eq!(id_list(&json!("T1")), vec!["T1".to_string()]);
        assert_eq!(id_list(&json!(["T1", 2])), vec!["T1".to_string(), "2".to_string()]);
        assert!(id_list(&json!(null)).is_empty());
    }
}
