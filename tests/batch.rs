mod common;

use std::time::Duration;

use oxibooks_porter::{
    batch::{BatchPoster, NO_RESPONSE_REASON},
    functions::create::post_single,
    store::PorterStatus,
};
use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use common::*;

fn work(count: usize) -> Vec<(String, Value)> {
    (1..=count)
        .map(|i| (i.to_string(), json!({ "DisplayName": format!("Customer {i}") })))
        .collect()
}

#[tokio::test]
async fn chunks_of_thirty_cover_every_item() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .and(query_param("minorversion", "65"))
        .respond_with(batch_responder(|id, _| Some(created("Customer", id))))
        .expect(3)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let poster = BatchPoster::new(&qb, "Customer").unwrap();
    let outcome = poster.post_batch(&work(73), 30).await;

    assert_eq!(outcome.updates.len(), 73);
    assert_eq!(outcome.successes().count(), 73);
    let requests = server.received_requests().await.unwrap();
    let sizes: Vec<usize> = requests.iter().map(|r| batch_items(r).len()).collect();
    assert_eq!(sizes, vec![30, 30, 13]);
    assert_eq!(batch_entity(&requests[0]), "Customer");
    assert_eq!(outcome.updates[72].target_id.as_deref(), Some("173"));
}

#[tokio::test]
async fn oversized_chunks_are_clamped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|id, _| Some(created("Customer", id))))
        .expect(2)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(31), 500).await;
    assert_eq!(outcome.successes().count(), 31);
}

#[tokio::test]
async fn partial_failures_stay_isolated() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|id, _| {
            let n: u32 = id.parse().unwrap();
            Some(if n % 2 == 0 {
                created("Customer", id)
            } else {
                fault(
                    "2020",
                    "Required param missing, need to supply the required value for the API",
                    "Required parameter PrimaryEmailAddr is missing",
                )
            })
        }))
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(10), 10).await;

    assert_eq!(outcome.successes().count(), 5);
    assert_eq!(outcome.failures().count(), 5);
    for update in outcome.failures() {
        assert_eq!(update.status, PorterStatus::Failed);
        assert_eq!(update.target_id, None);
        let reason = update.failure_reason.as_deref().unwrap();
        assert!(reason.starts_with("[2020] Required param missing"));
        assert!(update.increment_retry);
    }
}

#[tokio::test]
async fn missing_bid_fails_only_that_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|id, _| (id != "2").then(|| created("Customer", id))))
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(3), 10).await;

    let missing = outcome.updates.iter().find(|u| u.source_id == "2").unwrap();
    assert_eq!(missing.status, PorterStatus::Failed);
    assert_eq!(missing.failure_reason.as_deref(), Some(NO_RESPONSE_REASON));
    assert_eq!(outcome.successes().count(), 2);
}

#[tokio::test]
async fn http_error_fails_whole_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(2)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(4), 2).await;

    assert_eq!(outcome.failures().count(), 4);
    assert!(outcome
        .updates
        .iter()
        .all(|u| u.failure_reason.as_deref() == Some("HTTP 500: internal error")));
}

#[tokio::test]
async fn duplicate_with_embedded_id_needs_no_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|_, _| {
            Some(fault(
                "6240",
                "Duplicate Name Exists Error",
                "The name supplied already exists. : Id=12345",
            ))
        }))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(query_path()))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(1), 10).await;

    let update = &outcome.updates[0];
    assert_eq!(update.status, PorterStatus::Exists);
    assert_eq!(update.target_id.as_deref(), Some("12345"));
}

#[tokio::test]
async fn duplicate_without_id_is_looked_up_by_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|_, _| {
            Some(fault(
                "6240",
                "Duplicate Name Exists Error",
                "The name supplied already exists. : Another customer is already using this name.",
            ))
        }))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(query_path()))
        .and(query_param(
            "query",
            "select Id, DisplayName from Customer where DisplayName = 'Customer 1'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "QueryResponse": { "Customer": [{ "Id": "58", "DisplayName": "Customer 1" }] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(1), 10).await;

    assert_eq!(outcome.updates[0].status, PorterStatus::Exists);
    assert_eq!(outcome.updates[0].target_id.as_deref(), Some("58"));
}

#[tokio::test]
async fn unresolved_duplicate_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|_, _| {
            Some(fault(
                "6140",
                "Duplicate Document Number Error",
                "You must specify a different number.",
            ))
        }))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(query_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "QueryResponse": {} })))
        .expect(2)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(1), 10).await;

    let update = &outcome.updates[0];
    assert_eq!(update.status, PorterStatus::Failed);
    assert!(update.failure_reason.as_deref().unwrap().contains("could not resolve existing Id"));
}

#[tokio::test]
async fn duplicate_found_on_a_later_page_by_normalized_name() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .respond_with(batch_responder(|_, _| {
            Some(fault(
                "6240",
                "Duplicate Name Exists Error",
                "The name supplied already exists. : Another customer is already using this name.",
            ))
        }))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(query_path()))
        .and(query_param(
            "query",
            r"select Id, DisplayName from Customer where DisplayName = 'Amy\'s Bird'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "QueryResponse": {} })))
        .expect(1)
        .mount(&server)
        .await;
    let first_page: Vec<Value> = (1..=1000)
        .map(|i| json!({ "Id": i.to_string(), "DisplayName": format!("Customer {i}") }))
        .collect();
    Mock::given(method("GET"))
        .and(path(query_path()))
        .and(query_param(
            "query",
            "select Id, DisplayName from Customer STARTPOSITION 1 MAXRESULTS 1000",
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "QueryResponse": { "Customer": first_page } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(query_path()))
        .and(query_param(
            "query",
            "select Id, DisplayName from Customer STARTPOSITION 1001 MAXRESULTS 1000",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "QueryResponse": {
                "Customer": [
                    { "Id": "1001", "DisplayName": "Amy\u{2019}s Bird Sanctuary" },
                    { "Id": "1002", "DisplayName": "Amy\u{2019}s\u{00A0}Bird" }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let work = vec![("1".to_string(), json!({ "DisplayName": "Amy's Bird" }))];
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work, 10).await;

    let update = &outcome.updates[0];
    assert_eq!(update.status, PorterStatus::Exists);
    assert_eq!(update.target_id.as_deref(), Some("1002"));
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_for_the_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_url("").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-2",
            "refresh_token": "rt-2",
            "expires_in": 3600,
            "token_type": "bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("AuthenticationFailed"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(batch_path()))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(batch_responder(|id, _| Some(created("Customer", id))))
        .expect(1)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = BatchPoster::new(&qb, "Customer").unwrap().post_batch(&work(2), 10).await;
    assert_eq!(outcome.successes().count(), 2);
    assert_eq!(qb.tokens().snapshot().await.refresh_token, "rt-2");
}

#[tokio::test]
async fn concurrent_workers_share_one_refresh() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_url("").as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "expires_in": 3600
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(entity_path("Customer")))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(entity_path("Customer")))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(|request: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let id = if body["DisplayName"] == "Customer 1" { "201" } else { "202" };
            ResponseTemplate::new(200).set_body_json(json!({ "Customer": { "Id": id } }))
        })
        .expect(2)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let items = work(2);
    let (first, second) = tokio::join!(
        post_single(&qb, "Customer", &items[0].0, items[0].1.clone()),
        post_single(&qb, "Customer", &items[1].0, items[1].1.clone()),
    );
    assert_eq!(first.update.target_id.as_deref(), Some("201"));
    assert_eq!(second.update.target_id.as_deref(), Some("202"));
}

#[tokio::test]
async fn length_fault_walks_the_fallback_chain() {
    init_logging();
    let server = MockServer::start().await;
    let long_name = format!("Acme   Industrial {}", "Supply ".repeat(20));
    let collapsed = long_name.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped: String = long_name.chars().filter(|c| !c.is_whitespace()).collect();
    let truncated: String = collapsed.chars().take(100).collect::<String>().trim_end().to_string();

    Mock::given(method("POST"))
        .and(path(entity_path("Customer")))
        .and(body_partial_json(json!({ "DisplayName": truncated })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "Customer": { "Id": "77" } })),
        )
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(entity_path("Customer")))
        .respond_with(ResponseTemplate::new(400).set_body_json(fault(
            "6000",
            "A business validation error has occurred while processing your request",
            "Business Validation Error: Display Name cannot be more than 100 characters long.",
        )))
        .expect(3)
        .mount(&server)
        .await;

    let qb = context(&server.uri());
    let outcome = post_single(&qb, "Customer", "9", json!({ "DisplayName": long_name })).await;

    assert_eq!(outcome.update.status, PorterStatus::Success);
    assert_eq!(outcome.update.target_id.as_deref(), Some("77"));
    assert_eq!(outcome.replaced_payload, Some(json!({ "DisplayName": truncated })));
    assert_ne!(stripped, truncated);
}
