//! Read-only lookups used to find objects that already exist in QuickBooks.
use serde::Deserialize;
use serde_json::{Map, Value};

use super::id_string;
use crate::{recovery::normalize_name, APIError, APIResult, QBContext};

/// Page size QuickBooks allows for a single query.
pub const MAX_RESULTS: usize = 1000;
/// Upper bound on pages scanned while looking for a name.
pub const MAX_SCAN_PAGES: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponseExt {
    #[serde(default, rename = "QueryResponse")]
    pub query_response: Map<String, Value>,
}

/// Quotes `value` as a QuickBooks query string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Runs `query` and returns the `entity` objects it produced.
pub async fn qb_query(qb: &QBContext, entity: &str, query: &str) -> APIResult<Vec<Value>> {
    let reply = qb.get(&qb.query_url(query)?).await?;
    if !reply.is_success() {
        return Err(APIError::BadRequest {
            status: reply.status,
            body: reply.failure_reason(),
        });
    }
    let QueryResponseExt { mut query_response } = reply.json()?;
    match query_response.remove(entity) {
        Some(Value::Array(items)) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

/// Id of the `entity` whose `field` equals `value` exactly.
pub async fn find_by_exact_name(
    qb: &QBContext,
    entity: &str,
    field: &str,
    value: &str,
) -> APIResult<Option<String>> {
    let query = format!(
        "select Id, {field} from {entity} where {field} = {}",
        quote_literal(value)
    );
    let items = qb_query(qb, entity, &query).await?;
    Ok(items.first().and_then(|item| item.get("Id")).and_then(id_string))
}

/// Pages through every `entity` comparing normalized `field` values. Catches
/// names QuickBooks stores with different quotes or spacing than the source.
pub async fn scan_for_name(
    qb: &QBContext,
    entity: &str,
    field: &str,
    value: &str,
    page_size: usize,
    max_pages: usize,
) -> APIResult<Option<String>> {
    let wanted = normalize_name(value);
    let page_size = page_size.clamp(1, MAX_RESULTS);
    for page in 0..max_pages {
        let start = page * page_size + 1;
        let query = format!(
            "select Id, {field} from {entity} STARTPOSITION {start} MAXRESULTS {page_size}"
        );
        let items = qb_query(qb, entity, &query).await?;
        let found = items.iter().find(|item| {
            item.get(field)
                .and_then(Value::as_str)
                .is_some_and(|name| normalize_name(name) == wanted)
        });
        if let Some(id) = found.and_then(|item| item.get("Id")).and_then(id_string) {
            return Ok(Some(id));
        }
        if items.len() < page_size {
            break;
        }
    }
    Ok(None)
}

/// Exact-name lookup first, then a paged normalized scan.
pub async fn find_existing_id(
    qb: &QBContext,
    entity: &str,
    field: &str,
    value: &str,
) -> APIResult<Option<String>> {
    if let Some(id) = find_by_exact_name(qb, entity, field, value).await? {
        return Ok(Some(id));
    }
    log::debug!("No exact {entity}.{field} match for {value:?}, scanning");
    scan_for_name(qb, entity, field, value, MAX_RESULTS, MAX_SCAN_PAGES).await
}
