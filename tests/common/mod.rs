#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use intuit_oauth::{ClientCredentials, TokenManager, TokenState};
use oxibooks_porter::{client::ThrottlePolicy, limiter::RateLimiter, Environment, QBContext};
use serde_json::{json, Value};
use wiremock::{Request, ResponseTemplate};

pub const REALM: &str = "9130";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn token_url(server_uri: &str) -> String {
    format!("{server_uri}/oauth2/v1/tokens/bearer")
}

pub fn batch_path() -> String {
    format!("/v3/company/{REALM}/batch")
}

pub fn entity_path(entity: &str) -> String {
    format!("/v3/company/{REALM}/{}", entity.to_ascii_lowercase())
}

pub fn query_path() -> String {
    format!("/v3/company/{REALM}/query")
}

/// Context pointed at `server_uri` with tokens `at-1`/`rt-1`, a generous rate
/// limit and millisecond backoff.
pub fn context(server_uri: &str) -> QBContext {
    let tokens = TokenManager::new(
        ClientCredentials::new("id", "secret"),
        TokenState::new("at-1", "rt-1"),
    )
    .with_token_url(&token_url(server_uri))
    .unwrap();
    QBContext::new(Environment::SANDBOX, REALM, Arc::new(tokens), RateLimiter::new(1000.0))
        .unwrap()
        .with_base_url(&format!("{server_uri}/v3"))
        .unwrap()
        .with_throttle_policy(ThrottlePolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
}

/// Work items `(bId, payload)` of a captured batch request.
pub fn batch_items(request: &Request) -> Vec<(String, Value)> {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    body["BatchItemRequest"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| {
            let id = item["bId"].as_str().unwrap().to_string();
            let payload = item
                .as_object()
                .unwrap()
                .iter()
                .find(|(key, _)| *key != "bId" && *key != "operation")
                .map(|(_, payload)| payload.clone())
                .unwrap();
            (id, payload)
        })
        .collect()
}

/// Entity key of the first item of a captured batch request.
pub fn batch_entity(request: &Request) -> String {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    body["BatchItemRequest"][0]
        .as_object()
        .unwrap()
        .keys()
        .find(|key| *key != "bId" && *key != "operation")
        .cloned()
        .unwrap()
}

/// Batch responder: `reply(bId, payload)` gives the item's response body
/// (without `bId`), or `None` to leave the item out of the response.
pub fn batch_responder<F>(reply: F) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync + 'static
where
    F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
{
    move |request: &Request| {
        let items: Vec<Value> = batch_items(request)
            .iter()
            .filter_map(|(id, payload)| {
                let mut item = reply(id, payload)?;
                item["bId"] = json!(id);
                Some(item)
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({
            "BatchItemResponse": items,
            "time": "2024-03-01T10:00:00.000-08:00"
        }))
    }
}

/// Created-object item for `entity` with id `100 + bId`.
pub fn created(entity: &str, id: &str) -> Value {
    let target = 100 + id.parse::<u64>().unwrap_or(0);
    json!({ entity: { "Id": target.to_string(), "SyncToken": "0" } })
}

pub fn fault(code: &str, message: &str, detail: &str) -> Value {
    json!({
        "Fault": {
            "type": "ValidationFault",
            "Error": [{ "Message": message, "Detail": detail, "code": code, "element": "" }]
        }
    })
}
