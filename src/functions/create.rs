//! Single-record creates, used by the fallback pass for rows the batch
//! endpoint could not place.
use std::collections::VecDeque;

use serde_json::{Map, Value};

use super::created_id;
use crate::{
    error::{classify_fault, Fault, FaultKind},
    recovery::{length_fallback_candidates, name_field, resolve_duplicate, NAME_FIELDS},
    store::StatusUpdate,
    APIResult, QBContext,
};

#[derive(Debug, Clone, PartialEq)]
pub enum CreateReply {
    Created(String),
    Fault(Fault),
    Failed(String),
}

/// POSTs one `entity` payload to its create endpoint.
pub async fn qb_create(qb: &QBContext, entity: &str, payload: &Value) -> APIResult<CreateReply> {
    let reply = qb.post_json(&qb.entity_url(entity)?, payload).await?;
    if let Some(fault) = reply.fault() {
        return Ok(CreateReply::Fault(fault));
    }
    if !reply.is_success() {
        return Ok(CreateReply::Failed(reply.failure_reason()));
    }
    let body: Map<String, Value> = reply.json()?;
    Ok(match created_id(&body, entity) {
        Some(id) => CreateReply::Created(id),
        None => CreateReply::Failed(format!("Response without {entity}.Id")),
    })
}

/// Result of one single-record attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleOutcome {
    pub update: StatusUpdate,
    /// Payload that finally went through, when a length fallback changed it.
    pub replaced_payload: Option<Value>,
}

impl SingleOutcome {
    fn unchanged(update: StatusUpdate) -> Self {
        Self {
            update,
            replaced_payload: None,
        }
    }
}

/// Posts one payload, resolving duplicates and walking the length fallback
/// chain on the payload's name field. Never fails: every error becomes a
/// `Failed` update for `source_id`.
pub async fn post_single(
    qb: &QBContext,
    entity: &str,
    source_id: &str,
    payload: Value,
) -> SingleOutcome {
    let mut current = payload;
    let mut changed = false;
    let mut fallbacks: Option<VecDeque<String>> = None;

    loop {
        let fault = match qb_create(qb, entity, &current).await {
            Ok(CreateReply::Created(id)) => {
                log::info!("{entity} {source_id} created as {id}");
                return SingleOutcome {
                    update: StatusUpdate::success(source_id, id),
                    replaced_payload: changed.then_some(current),
                };
            }
            Ok(CreateReply::Failed(reason)) => {
                log::error!("{entity} {source_id} failed: {reason}");
                return SingleOutcome::unchanged(StatusUpdate::failed(source_id, reason));
            }
            Err(e) => {
                log::error!("{entity} {source_id} failed: {e}");
                return SingleOutcome::unchanged(StatusUpdate::failed(source_id, e.to_string()));
            }
            Ok(CreateReply::Fault(fault)) => fault,
        };

        let Some(error) = fault.primary() else {
            return SingleOutcome::unchanged(StatusUpdate::failed(source_id, fault.reason()));
        };

        match classify_fault(error) {
            FaultKind::Duplicate => {
                let update = resolve_duplicate(qb, entity, source_id, &current, error).await;
                return SingleOutcome {
                    update,
                    replaced_payload: None,
                };
            }
            FaultKind::LengthLimit => {
                let Some((field, name)) = name_field(&current, NAME_FIELDS) else {
                    log::error!("{entity} {source_id}: length fault without a name field");
                    let update = StatusUpdate::failed(source_id, fault.reason());
                    return SingleOutcome::unchanged(update);
                };
                let queue =
                    fallbacks.get_or_insert_with(|| length_fallback_candidates(name).into());
                let Some(next) = queue.pop_front() else {
                    log::error!("{entity} {source_id}: length fallbacks exhausted");
                    return SingleOutcome::unchanged(StatusUpdate::failed(
                        source_id,
                        format!("{} | length fallbacks exhausted", fault.reason()),
                    ));
                };
                log::warn!("{entity} {source_id}: {field} too long, retrying as {next:?}");
                current[field] = Value::String(next);
                changed = true;
            }
            FaultKind::RateLimit | FaultKind::Auth | FaultKind::Other => {
                log::error!("{entity} {source_id} rejected: {}", fault.reason());
                return SingleOutcome::unchanged(StatusUpdate::failed(source_id, fault.reason()));
            }
        }
    }
}
