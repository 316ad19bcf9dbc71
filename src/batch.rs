//! Chunked creates through the QuickBooks `/batch` endpoint.
//!
//! The poster never touches the mapping store: it turns every work item into
//! exactly one [`StatusUpdate`] (or none, when cancelled before its chunk was
//! sent) and leaves persistence to the caller.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    error::{classify_fault, Fault, FaultKind},
    functions::created_id,
    recovery::resolve_duplicate,
    store::StatusUpdate,
    APIResult, QBContext,
};

/// Hard QuickBooks limit on operations per batch request.
pub const MAX_BATCH_ITEMS: usize = 30;

pub const NO_RESPONSE_REASON: &str = "No response for bId";

#[derive(Serialize, Debug)]
struct QBBatchRequest<'a> {
    #[serde(rename = "BatchItemRequest")]
    items: Vec<QBBatchItem<QBResourceOperation<'a>>>,
}

#[derive(Serialize, Deserialize, Debug)]
struct QBBatchItem<T> {
    #[serde(rename = "bId")]
    b_id: String,
    #[serde(flatten)]
    item: T,
}

#[derive(Serialize, Debug)]
struct QBResourceOperation<'a> {
    operation: QBOperationType,
    #[serde(flatten)]
    resource: BTreeMap<&'a str, &'a Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum QBOperationType {
    Create,
}

#[derive(Deserialize, Debug)]
struct BatchResponseExt {
    #[serde(rename = "BatchItemResponse", default)]
    items: Vec<QBBatchItem<Map<String, Value>>>,
}

/// Replaces the trailing `/<entity>` segment of a create URL with `/batch`,
/// keeping the query string.
pub fn derive_batch_url(create_url: &Url) -> Result<Url, url::ParseError> {
    let mut url = create_url.clone();
    url.path_segments_mut()
        .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .pop()
        .push("batch");
    Ok(url)
}

/// Per-item results of one `post_batch` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub updates: Vec<StatusUpdate>,
}

impl BatchOutcome {
    pub fn successes(&self) -> impl Iterator<Item = &StatusUpdate> {
        self.updates.iter().filter(|u| u.status.is_done())
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatusUpdate> {
        self.updates.iter().filter(|u| !u.status.is_done())
    }
}

pub struct BatchPoster<'a> {
    qb: &'a QBContext,
    entity: String,
    batch_url: Url,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BatchPoster<'a> {
    pub fn new(qb: &'a QBContext, entity: &str) -> APIResult<Self> {
        let batch_url = derive_batch_url(&qb.entity_url(entity)?)?;
        Ok(Self {
            qb,
            entity: entity.to_string(),
            batch_url,
            cancel: None,
        })
    }

    /// Stops sending new chunks once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn batch_url(&self) -> &Url {
        &self.batch_url
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Creates every `(source_id, payload)` in chunks of at most `chunk_size`
    /// (clamped to 1..=30) operations.
    pub async fn post_batch(&self, work: &[(String, Value)], chunk_size: usize) -> BatchOutcome {
        let chunk_size = chunk_size.clamp(1, MAX_BATCH_ITEMS);
        let mut outcome = BatchOutcome::default();
        for chunk in work.chunks(chunk_size) {
            if self.cancelled() {
                let unsent = work.len() - outcome.updates.len();
                log::warn!("{}: cancelled, {unsent} items left unsent", self.entity);
                break;
            }
            outcome.updates.extend(self.post_chunk(chunk).await);
        }
        outcome
    }

    async fn post_chunk(&self, chunk: &[(String, Value)]) -> Vec<StatusUpdate> {
        let request = QBBatchRequest {
            items: chunk
                .iter()
                .map(|(id, payload)| QBBatchItem {
                    b_id: id.clone(),
                    item: QBResourceOperation {
                        operation: QBOperationType::Create,
                        resource: BTreeMap::from([(self.entity.as_str(), payload)]),
                    },
                })
                .collect(),
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(e) => return fail_all(&self.entity, chunk, &format!("Could not encode batch: {e}")),
        };

        let reply = match self.qb.post_json(&self.batch_url, &body).await {
            Ok(reply) => reply,
            Err(e) => return fail_all(&self.entity, chunk, &e.to_string()),
        };
        if !reply.is_success() {
            return fail_all(&self.entity, chunk, &reply.failure_reason());
        }
        let response: BatchResponseExt = match reply.json() {
            Ok(response) => response,
            Err(e) => {
                return fail_all(
                    &self.entity,
                    chunk,
                    &format!("Unparseable batch response ({e}): {}", reply.body),
                )
            }
        };

        let mut by_id: HashMap<String, Map<String, Value>> = response
            .items
            .into_iter()
            .map(|item| (item.b_id, item.item))
            .collect();

        let mut updates = Vec::with_capacity(chunk.len());
        for (id, payload) in chunk {
            let update = match by_id.remove(id) {
                Some(item) => self.reconcile(id, payload, &item).await,
                None => {
                    log::error!("{} {id}: {NO_RESPONSE_REASON}", self.entity);
                    StatusUpdate::failed(id, NO_RESPONSE_REASON)
                }
            };
            updates.push(update);
        }
        for unexpected in by_id.keys() {
            log::warn!("{}: batch response for unknown bId {unexpected}", self.entity);
        }
        updates
    }

    async fn reconcile(
        &self,
        id: &str,
        payload: &Value,
        item: &Map<String, Value>,
    ) -> StatusUpdate {
        if let Some(target_id) = created_id(item, &self.entity) {
            log::info!("{} {id} created as {target_id}", self.entity);
            return StatusUpdate::success(id, target_id);
        }

        let fault = item
            .get("Fault")
            .and_then(|fault| serde_json::from_value::<Fault>(fault.clone()).ok());
        let Some(fault) = fault else {
            let reason = format!("Batch item without {}.Id or Fault", self.entity);
            log::error!("{} {id}: {reason}", self.entity);
            return StatusUpdate::failed(id, reason);
        };

        match fault.primary() {
            Some(error) if classify_fault(error) == FaultKind::Duplicate => {
                log::warn!("{} {id}: duplicate, resolving existing object", self.entity);
                resolve_duplicate(self.qb, &self.entity, id, payload, error).await
            }
            _ => {
                log::error!("{} {id} rejected: {}", self.entity, fault.reason());
                StatusUpdate::failed(id, fault.reason())
            }
        }
    }
}

fn fail_all(entity: &str, chunk: &[(String, Value)], reason: &str) -> Vec<StatusUpdate> {
    log::error!("{entity}: batch of {} failed: {reason}", chunk.len());
    chunk
        .iter()
        .map(|(id, _)| StatusUpdate::failed(id, reason))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn batch_url_replaces_entity_segment() {
        let create = Url::parse(
            "https://sandbox-quickbooks.api.intuit.com/v3/company/9130/invoice?minorversion=65",
        )
        .unwrap();
        assert_eq!(
            derive_batch_url(&create).unwrap().as_str(),
            "https://sandbox-quickbooks.api.intuit.com/v3/company/9130/batch?minorversion=65"
        );
        let trailing = Url::parse("http://localhost:8080/v3/company/1/customer/").unwrap();
        assert_eq!(
            derive_batch_url(&trailing).unwrap().as_str(),
            "http://localhost:8080/v3/company/1/batch"
        );
    }

    #[test]
    fn serializes_batch_items() {
        let payload = json!({ "DisplayName": "Smith Family Store" });
        let request = QBBatchRequest {
            items: vec![QBBatchItem {
                b_id: "17".into(),
                item: QBResourceOperation {
                    operation: QBOperationType::Create,
                    resource: BTreeMap::from([("Vendor", &payload)]),
                },
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "BatchItemRequest": [
                    {
                        "bId": "17",
                        "operation": "create",
                        "Vendor": { "DisplayName": "Smith Family Store" }
                    }
                ]
            })
        );
    }

    #[test]
    fn parses_mixed_batch_response() {
        let s = r#"{
  "BatchItemResponse": [
    {
      "Fault": {
        "type": "ValidationFault",
        "Error": [
          {
            "Message": "Duplicate Name Exists Error",
            "code": "6240",
            "Detail": "The name supplied already exists. : Another customer is using this \nname.",
            "element": ""
          }
        ]
      },
      "bId": "bid1"
    },
    {
      "Vendor": { "DisplayName": "Smith Family Store", "Id": "71", "SyncToken": "0" },
      "bId": "bid2"
    }
  ],
  "time": "2016-04-15T09:01:18.141-07:00"
}"#;
        let response: BatchResponseExt = serde_json::from_str(s).unwrap();
        assert_eq!(response.items.len(), 2);
        assert_eq!(response.items[0].b_id, "bid1");
        let fault: Fault = serde_json::from_value(response.items[0].item["Fault"].clone()).unwrap();
        assert_eq!(fault.primary().unwrap().code, "6240");
        assert_eq!(created_id(&response.items[1].item, "Vendor").as_deref(), Some("71"));
    }
}
