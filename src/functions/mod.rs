use serde_json::Value;

pub mod create;
pub mod query;

/// QuickBooks ids come back as strings, but be lenient about numbers.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// `Id` of the `entity` object in a create or batch item response.
pub(crate) fn created_id(body: &serde_json::Map<String, Value>, entity: &str) -> Option<String> {
    body.get(entity)?.get("Id").and_then(id_string)
}
