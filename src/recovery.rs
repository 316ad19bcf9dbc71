//! Recovery strategies for the two fault kinds that are not terminal:
//! duplicates (find the existing object) and length limits (shorten the name).
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::{
    error::FaultError,
    functions::query::find_existing_id,
    store::StatusUpdate,
    QBContext,
};

/// Payload fields naming the object, in lookup order.
pub const NAME_FIELDS: &[&str] = &["DisplayName", "Name", "FullyQualifiedName"];
/// Fields that may identify an existing object after a duplicate fault.
pub const LOOKUP_FIELDS: &[&str] = &["DisplayName", "Name", "FullyQualifiedName", "DocNumber"];
/// Name lengths tried, in order, once whitespace cleanup did not help.
pub const TRUNCATION_STEPS: &[usize] = &[100, 80, 60, 50, 40, 30, 20];

static EMBEDDED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Id\s*=\s*(\d+)").expect("embedded id pattern compiles"));

/// `Id=NNN` quoted in a duplicate fault's detail or message.
#[must_use]
pub fn embedded_id(error: &FaultError) -> Option<String> {
    [error.detail.as_str(), error.message.as_str()]
        .into_iter()
        .find_map(|text| EMBEDDED_ID.captures(text))
        .map(|captures| captures[1].to_string())
}

/// First of `fields` present as a non-empty string in `payload`.
#[must_use]
pub fn name_field<'a>(
    payload: &'a Value,
    fields: &[&'static str],
) -> Option<(&'static str, &'a str)> {
    fields.iter().find_map(|field| {
        payload
            .get(*field)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(|value| (*field, value))
    })
}

/// Comparable form of a name: typographic quotes and non-breaking spaces
/// folded, surrounding whitespace trimmed, case ignored.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            '\u{00A0}' | '\u{2007}' | '\u{202F}' => ' ',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_lowercase()
}

/// Successive replacement names for a value QuickBooks rejected as too long:
/// collapsed whitespace, no whitespace, then truncations of the collapsed
/// form. Values equal to the original or to an earlier candidate are dropped.
#[must_use]
pub fn length_fallback_candidates(name: &str) -> Vec<String> {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped: String = name.chars().filter(|c| !c.is_whitespace()).collect();

    let mut candidates: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !candidate.is_empty() && candidate != name && !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    };
    push(collapsed.clone());
    push(stripped);
    for &max in TRUNCATION_STEPS {
        if collapsed.chars().count() > max {
            push(collapsed.chars().take(max).collect::<String>().trim_end().to_string());
        }
    }
    candidates
}

/// Resolves a duplicate fault to the existing object's id.
///
/// An id quoted in the fault wins without any request; otherwise the
/// payload's name is looked up, exactly and then by normalized scan.
pub async fn resolve_duplicate(
    qb: &QBContext,
    entity: &str,
    source_id: &str,
    payload: &Value,
    error: &FaultError,
) -> StatusUpdate {
    let reason = format!("[{}] {}: {}", error.code, error.message, error.detail);

    if let Some(id) = embedded_id(error) {
        log::info!("{entity} {source_id} already exists in QuickBooks as {id}");
        return StatusUpdate::exists(source_id, id);
    }

    let Some((field, name)) = name_field(payload, LOOKUP_FIELDS) else {
        log::error!("{entity} {source_id}: duplicate fault without a name to look up");
        return StatusUpdate::failed(source_id, format!("{reason} | could not resolve existing Id"));
    };

    match find_existing_id(qb, entity, field, name).await {
        Ok(Some(id)) => {
            log::info!("{entity} {source_id} matched existing {field} {name:?} as {id}");
            StatusUpdate::exists(source_id, id)
        }
        Ok(None) => {
            log::error!("{entity} {source_id}: duplicate {field} {name:?} not found by query");
            StatusUpdate::failed(source_id, format!("{reason} | could not resolve existing Id"))
        }
        Err(e) => {
            log::error!("{entity} {source_id}: existing-object lookup failed: {e}");
            StatusUpdate::failed(source_id, format!("{reason} | lookup failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn finds_embedded_ids() {
        let error = FaultError {
            message: "Duplicate Name Exists Error".into(),
            detail: "The name supplied already exists. : Id=12345".into(),
            code: "6240".into(),
            element: None,
        };
        assert_eq!(embedded_id(&error).as_deref(), Some("12345"));

        let spaced = FaultError {
            message: "Duplicate Document Number Error : Id = 77".into(),
            ..FaultError::default()
        };
        assert_eq!(embedded_id(&spaced).as_deref(), Some("77"));
        assert_eq!(embedded_id(&FaultError::default()), None);
    }

    #[test]
    fn picks_first_present_name_field() {
        let payload = json!({ "Name": "Checking", "FullyQualifiedName": "Bank:Checking" });
        assert_eq!(name_field(&payload, NAME_FIELDS), Some(("Name", "Checking")));
        assert_eq!(name_field(&json!({ "DisplayName": "  " }), NAME_FIELDS), None);
        assert_eq!(
            name_field(&json!({ "DocNumber": "1001" }), LOOKUP_FIELDS),
            Some(("DocNumber", "1001"))
        );
    }

    #[test]
    fn normalizes_quotes_and_spaces() {
        assert_eq!(normalize_name("  Amy\u{2019}s\u{00A0}Bird  "), "amy's bird");
        assert_eq!(normalize_name("\u{201C}Q\u{201D}"), "\"q\"");
    }

    #[test]
    fn length_candidates_in_order() {
        let long = format!("Acme   Corp {}", "x".repeat(120));
        let candidates = length_fallback_candidates(&long);
        assert_eq!(candidates[0], format!("Acme Corp {}", "x".repeat(120)));
        assert_eq!(candidates[1], format!("AcmeCorp{}", "x".repeat(120)));
        let lengths: Vec<usize> = candidates[2..].iter().map(|c| c.chars().count()).collect();
        assert_eq!(lengths, vec![100, 80, 60, 50, 40, 30, 20]);
    }

    #[test]
    fn short_clean_names_only_lose_whitespace() {
        assert_eq!(length_fallback_candidates("Acme Corp"), vec!["AcmeCorp".to_string()]);
        assert!(length_fallback_candidates("Acme").is_empty());
    }
}
