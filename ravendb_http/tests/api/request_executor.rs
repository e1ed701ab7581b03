use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ravendb_http::{
    commands::GetDocumentsCommand, events::RequestEvents, NodeFailure, RequestExecutor,
    RequestExecutorError, RequestExecutorOptions,
};
use tokio::task::JoinSet;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::helpers::{
    cluster_executor, document_body, init_tracing, quiet_conventions, single_node_executor,
    topology_body, wait_until, DATABASE,
};

async fn mount_topology(server: &MockServer, servers: &[&MockServer], etag: i64) {
    Mock::given(method("GET"))
        .and(path("/topology"))
        .and(query_param("name", DATABASE))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(servers, etag)))
        .mount(server)
        .await;
}

fn database_missing() -> ResponseTemplate {
    ResponseTemplate::new(503)
        .insert_header("Database-Missing", DATABASE)
        .set_body_json(serde_json::json!({
            "Type": "Raven.Client.Exceptions.Database.DatabaseDoesNotExistException",
            "Message": "Database 'db' was not found",
        }))
}

/// Executor whose client keeps at most one idle connection and gives up quickly, so a call that
/// leaves its connection checked out shows up as a stalled or failing follow-up call.
fn constrained_single_node_executor(server: &MockServer) -> RequestExecutor {
    let http_client = reqwest::Client::builder()
        .http1_only()
        .pool_max_idle_per_host(1)
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    RequestExecutor::new_for_single_node(
        &server.uri(),
        DATABASE,
        RequestExecutorOptions {
            http_client,
            conventions: quiet_conventions().with_request_timeout(Duration::from_secs(2)),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn missing_database_failures_do_not_block_the_connection_pool() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(database_missing())
        .expect(41)
        .mount(&server)
        .await;
    let executor = constrained_single_node_executor(&server);

    // Act
    let mut calls = JoinSet::new();
    for i in 0..40 {
        let executor = executor.clone();
        calls.spawn(async move {
            let mut command = GetDocumentsCommand::by_id(format!("users/{}", i));
            executor.execute(&mut command).await
        });
    }
    let results = tokio::time::timeout(Duration::from_secs(10), async {
        let mut results = Vec::new();
        while let Some(result) = calls.join_next().await {
            results.push(result.unwrap());
        }
        results
    })
    .await
    .expect("callers should not hang on a missing database");

    let mut command = GetDocumentsCommand::by_id("users/after");
    let after_failures =
        tokio::time::timeout(Duration::from_secs(3), executor.execute(&mut command))
            .await
            .expect("a call after many failures should not wait for a connection");

    // Assert
    assert_eq!(results.len(), 40);
    for result in results {
        assert!(matches!(
            result,
            Err(RequestExecutorError::DatabaseDoesNotExist(ref db)) if db == DATABASE
        ));
    }
    assert!(matches!(
        after_failures,
        Err(RequestExecutorError::DatabaseDoesNotExist(ref db)) if db == DATABASE
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 41);
}

#[tokio::test]
async fn failing_node_fails_over_to_the_next_one() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    mount_topology(&node_a, &[&node_a, &node_b], 1).await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&node_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document_body("users/1")))
        .expect(1)
        .mount(&node_b)
        .await;
    let executor = cluster_executor(&[&node_a, &node_b]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert_eq!(executor.topology_etag(), 1);
    assert_eq!(command.result().unwrap()["Results"][0]["Name"], "Jane");
}

#[tokio::test]
async fn all_nodes_failing_reports_each_cause() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    mount_topology(&node_a, &[&node_a, &node_b], 1).await;
    for node in [&node_a, &node_b] {
        Mock::given(method("GET"))
            .and(path("/databases/db/docs"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(node)
            .await;
    }
    let executor = cluster_executor(&[&node_a, &node_b]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    let result = executor.execute(&mut command).await;

    // Assert
    let err = result.unwrap_err();
    let failed_nodes = err.failed_nodes().expect("expected AllNodesFailed");
    assert_eq!(failed_nodes.len(), 2);
    assert!(failed_nodes
        .iter()
        .all(|(_, failure)| matches!(failure, NodeFailure::ServerError { status: 502, .. })));
}

#[tokio::test]
async fn missing_database_is_not_retried_on_other_nodes() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    mount_topology(&node_a, &[&node_a, &node_b], 1).await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(database_missing())
        .expect(1)
        .mount(&node_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document_body("users/1")))
        .expect(0)
        .mount(&node_b)
        .await;
    let executor = cluster_executor(&[&node_a, &node_b]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    let result = executor.execute(&mut command).await;

    // Assert
    assert!(matches!(
        result,
        Err(RequestExecutorError::DatabaseDoesNotExist(_))
    ));
}

#[tokio::test]
async fn unknown_database_fails_the_first_topology_update() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    for node in [&node_a, &node_b] {
        Mock::given(method("GET"))
            .and(path("/topology"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(node)
            .await;
    }
    let executor = cluster_executor(&[&node_a, &node_b]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    let result = executor.execute(&mut command).await;

    // Assert
    assert!(matches!(
        result,
        Err(RequestExecutorError::DatabaseDoesNotExist(_))
    ));
}

#[tokio::test]
async fn unreachable_topology_falls_back_to_configured_urls() {
    // Arrange
    init_tracing();
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&node)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document_body("users/1")))
        .expect(1)
        .mount(&node)
        .await;
    let executor = cluster_executor(&[&node]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();

    // Assert
    let topology = executor.topology();
    assert_eq!(topology.etag, -1);
    assert_eq!(topology.nodes[0].url(), node.uri());
}

#[tokio::test]
async fn concurrent_first_calls_share_one_topology_download() {
    // Arrange
    init_tracing();
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(topology_body(&[&node], 3))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&node)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document_body("users/1")))
        .expect(10)
        .mount(&node)
        .await;
    let executor = cluster_executor(&[&node]);

    // Act
    let mut calls = JoinSet::new();
    for _ in 0..10 {
        let executor = executor.clone();
        calls.spawn(async move {
            let mut command = GetDocumentsCommand::by_id("users/1");
            executor.execute(&mut command).await
        });
    }

    // Assert
    while let Some(result) = calls.join_next().await {
        assert!(result.unwrap().is_ok());
    }
    assert_eq!(executor.topology_etag(), 3);
}

#[tokio::test]
async fn not_modified_response_is_served_from_cache() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .and(header("If-None-Match", "\"A:1-abc\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"A:1-abc\"")
                .set_body_json(document_body("users/1")),
        )
        .expect(1)
        .mount(&server)
        .await;
    let executor = single_node_executor(&server);

    // Act
    let mut first = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut first).await.unwrap();
    let mut second = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut second).await.unwrap();

    // Assert
    assert!(!first.served_from_cache());
    assert!(second.served_from_cache());
    assert_eq!(first.result(), second.result());
    assert_eq!(executor.cache().len(), 1);
}

#[tokio::test]
async fn not_found_is_an_empty_result_and_evicts_the_cache() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let executor = single_node_executor(&server);
    let url = format!("{}/databases/db/docs?id=users%2F1", server.uri());
    executor
        .cache()
        .set(url.as_str(), "A:1-abc", bytes::Bytes::from_static(b"{}"));

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert!(command.result().is_none());
    assert!(executor.cache().get(&url).is_none());
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    mount_topology(&node_a, &[&node_a, &node_b], 1).await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "Type": "System.ArgumentException",
            "Message": "Bad id",
        })))
        .expect(1)
        .mount(&node_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&node_b)
        .await;
    let executor = cluster_executor(&[&node_a, &node_b]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    let result = executor.execute(&mut command).await;

    // Assert
    match result {
        Err(RequestExecutorError::BadRequest(message)) => assert!(message.contains("Bad id")),
        other => panic!("expected BadRequest, got {:?}", other),
    }
}

#[tokio::test]
async fn refresh_topology_header_triggers_a_background_update() {
    // Arrange
    init_tracing();
    let node_a = MockServer::start().await;
    let node_b = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(&[&node_a], 1)))
        .up_to_n_times(1)
        .mount(&node_a)
        .await;
    mount_topology(&node_a, &[&node_a, &node_b], 2).await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .and(header("Topology-Etag", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Refresh-Topology", "true")
                .set_body_json(document_body("users/1")),
        )
        .expect(1)
        .mount(&node_a)
        .await;
    let executor = cluster_executor(&[&node_a]);

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();

    // Assert
    let refreshed = wait_until(Duration::from_secs(5), || executor.topology_etag() == 2).await;
    assert!(refreshed, "topology should refresh in the background");
    assert_eq!(executor.topology().nodes.len(), 2);
}

#[tokio::test]
async fn request_listeners_see_each_attempt() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document_body("users/1")))
        .mount(&server)
        .await;
    let executor = single_node_executor(&server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = executor.add_request_listener(move |event| {
        let name = match event {
            RequestEvents::BeforeRequest { .. } => "before",
            RequestEvents::SucceedRequest { .. } => "succeeded",
            RequestEvents::FailedRequest { .. } => "failed",
            RequestEvents::TopologyUpdated { .. } => "topology",
        };
        sink.lock().unwrap().push(name);
    });

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();
    executor.remove_request_listener(handle);
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert_eq!(*seen.lock().unwrap(), vec!["before", "succeeded"]);
}

#[tokio::test]
async fn closed_executor_refuses_commands() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    let executor = cluster_executor(&[&server]);

    // Act
    executor.close().await;
    let mut command = GetDocumentsCommand::by_id("users/1");
    let result = executor.execute(&mut command).await;

    // Assert
    assert!(matches!(result, Err(RequestExecutorError::Closed)));
}
