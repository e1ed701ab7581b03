use std::{sync::Arc, time::Duration};

use ravendb_http::{
    changes::{
        ChannelChangesConnector, DatabaseChange, DatabaseChangesConnector, DocumentChangeType,
    },
    commands::GetDocumentsCommand,
    AggressiveCacheOptions, DocumentStore, DocumentStoreError,
};
use tokio::task::JoinSet;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::helpers::{
    document_body, init_tracing, quiet_conventions, single_node_executor, wait_until,
    CountingConnector, DATABASE,
};

fn cached_document(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("ETag", "\"A:7-xyz\"")
        .set_body_json(document_body(id))
}

fn store_for(server: &MockServer, connector: Arc<dyn DatabaseChangesConnector>) -> DocumentStore {
    DocumentStore::builder()
        .set_urls(&[server.uri()])
        .set_database_name(DATABASE)
        .set_conventions(quiet_conventions().with_disable_topology_updates(true))
        .set_changes_connector(connector)
        .build()
        .unwrap()
}

#[tokio::test]
async fn aggressive_caching_skips_the_network_while_fresh() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(cached_document("users/1"))
        .expect(1)
        .mount(&server)
        .await;
    let executor = single_node_executor(&server);
    let _guard = executor.aggressively_cache_for(Duration::from_secs(60));

    // Act
    let mut results = Vec::new();
    for _ in 0..3 {
        let mut command = GetDocumentsCommand::by_id("users/1");
        executor.execute(&mut command).await.unwrap();
        results.push(command.served_from_cache());
    }

    // Assert
    assert_eq!(results, vec![false, true, true]);
}

#[tokio::test]
async fn expired_entries_are_revalidated() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(cached_document("users/1"))
        .expect(2)
        .mount(&server)
        .await;
    let executor = single_node_executor(&server);
    let _guard = executor.aggressively_cache_for(Duration::from_millis(50));

    // Act
    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert!(!command.served_from_cache());
}

#[tokio::test]
async fn document_change_evicts_aggressively_cached_response() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .and(query_param("id", "users/1"))
        .respond_with(cached_document("users/1"))
        .expect(2)
        .mount(&server)
        .await;
    let connector = Arc::new(ChannelChangesConnector::new());
    let store = store_for(&server, connector.clone());
    let _guard = store
        .aggressively_cache_for(Duration::from_secs(60), None)
        .await
        .unwrap();
    let executor = store.get_request_executor(None).await.unwrap();

    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();
    executor.execute(&mut command).await.unwrap();
    assert!(command.served_from_cache());

    // Act
    let delivered = connector.publish(
        DATABASE,
        DatabaseChange::Document {
            id: "users/1".to_string(),
            collection: Some("Users".to_string()),
            change_type: DocumentChangeType::Put,
        },
    );
    let evicted = wait_until(Duration::from_secs(5), || executor.cache().is_empty()).await;
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert_eq!(delivered, 1);
    assert!(evicted);
    assert!(!command.served_from_cache());
    store.close().await;
}

#[tokio::test]
async fn response_in_flight_during_a_change_is_not_served_aggressively() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .and(query_param("id", "users/1"))
        .respond_with(cached_document("users/1").set_delay(Duration::from_millis(300)))
        .expect(2)
        .mount(&server)
        .await;
    let connector = Arc::new(ChannelChangesConnector::new());
    let store = store_for(&server, connector.clone());
    let _guard = store
        .aggressively_cache_for(Duration::from_secs(60), None)
        .await
        .unwrap();
    let executor = store.get_request_executor(None).await.unwrap();
    let generation_before = executor.cache().generation();

    // Act
    let in_flight = {
        let executor = executor.clone();
        tokio::spawn(async move {
            let mut command = GetDocumentsCommand::by_id("users/1");
            executor.execute(&mut command).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    connector.publish(
        DATABASE,
        DatabaseChange::Document {
            id: "users/1".to_string(),
            collection: Some("Users".to_string()),
            change_type: DocumentChangeType::Put,
        },
    );
    let invalidated = wait_until(Duration::from_secs(5), || {
        executor.cache().generation() > generation_before
    })
    .await;
    in_flight.await.unwrap().unwrap();

    let mut command = GetDocumentsCommand::by_id("users/1");
    executor.execute(&mut command).await.unwrap();

    // Assert
    assert!(invalidated);
    assert!(!command.served_from_cache());
    store.close().await;
}

#[tokio::test]
async fn concurrent_enables_connect_the_change_feed_once() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    let connector = Arc::new(CountingConnector::default());
    let store = store_for(&server, connector.clone());

    // Act
    let mut calls = JoinSet::new();
    for _ in 0..10 {
        let store = store.clone();
        calls.spawn(async move {
            store
                .aggressively_cache_for(Duration::from_secs(60), None)
                .await
                .map(|guard| guard.previous())
        });
    }
    while let Some(result) = calls.join_next().await {
        assert!(result.unwrap().is_ok());
    }

    // Assert
    assert_eq!(connector.connects(), 1);
    let executor = store.get_request_executor(None).await.unwrap();
    assert!(executor.cache_evictor().is_some());
}

#[tokio::test]
async fn failed_change_feed_connection_is_retried_on_next_enable() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    let connector = Arc::new(CountingConnector::failing_once());
    let store = store_for(&server, connector.clone());
    let executor = store.get_request_executor(None).await.unwrap();

    // Act
    let first = store
        .aggressively_cache_for(Duration::from_secs(60), None)
        .await;
    let caching_after_failure = executor.aggressive_caching();
    let second = store
        .aggressively_cache_for(Duration::from_secs(60), None)
        .await;

    // Assert
    assert!(matches!(first, Err(DocumentStoreError::Changes(_))));
    assert_eq!(caching_after_failure, None);
    assert!(second.is_ok());
    assert_eq!(connector.connects(), 2);
    assert_eq!(
        executor.aggressive_caching(),
        Some(AggressiveCacheOptions::new(Duration::from_secs(60)))
    );
}

#[tokio::test]
async fn disable_and_restore_nest_per_database() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    let store = store_for(&server, Arc::new(CountingConnector::default()));
    let executor = store.get_request_executor(None).await.unwrap();
    let hour = AggressiveCacheOptions::new(Duration::from_secs(3600));

    // Act & Assert
    let enabled = store
        .aggressively_cache_for(hour.duration, None)
        .await
        .unwrap();
    assert_eq!(executor.aggressive_caching(), Some(hour));

    let disabled = store.disable_aggressive_caching(None).await.unwrap();
    assert_eq!(executor.aggressive_caching(), None);
    assert_eq!(disabled.previous(), Some(hour));

    disabled.restore();
    assert_eq!(executor.aggressive_caching(), Some(hour));

    drop(enabled);
    assert_eq!(executor.aggressive_caching(), None);
}

#[tokio::test]
async fn aggressively_cache_uses_the_configured_duration() {
    // Arrange
    init_tracing();
    let server = MockServer::start().await;
    let store = DocumentStore::builder()
        .set_urls(&[server.uri()])
        .set_database_name(DATABASE)
        .set_conventions(
            quiet_conventions()
                .with_disable_topology_updates(true)
                .with_aggressive_cache_duration(Duration::from_secs(90)),
        )
        .build()
        .unwrap();

    // Act
    let _guard = store.aggressively_cache(None).await.unwrap();

    // Assert
    let executor = store.get_request_executor(None).await.unwrap();
    assert_eq!(
        executor.aggressive_caching(),
        Some(AggressiveCacheOptions::new(Duration::from_secs(90)))
    );
    assert!(executor.cache_evictor().is_none());
}
