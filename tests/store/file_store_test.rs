//! Tests for `src/store/file.rs` — JSON registry snapshots.

use connsync::descriptor::{ConnectionDescriptor, ConnectionSpec};
use connsync::store::{ClusterStateStore, FileStateStore, StoreError};

const REGISTRY: &str = r#"{
    "consumer:f1:c1": {
        "flowId": "f1",
        "componentId": "c1",
        "topics": ["orders"],
        "groupId": "g1",
        "fromBeginning": true,
        "auth": {"brokers": ["kafka:9092"], "ssl": false},
        "registeredBy": "flow-manager"
    },
    "producer:f1:c2": {
        "flowId": "f1",
        "componentId": "c2"
    }
}"#;

#[tokio::test]
async fn enumerates_and_gets_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    std::fs::write(&path, REGISTRY).expect("write registry");
    let store = FileStateStore::new(&path);

    let entries = store.enumerate_all().await.expect("enumerate");
    let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["consumer:f1:c1", "producer:f1:c2"]);

    let consumer = store
        .get("consumer:f1:c1")
        .await
        .expect("get")
        .expect("registered");
    let descriptor =
        ConnectionDescriptor::from_value("consumer:f1:c1", &consumer).expect("valid entry");
    assert_eq!(descriptor.id().to_string(), "consumer:f1:c1");
    assert_eq!(descriptor.auth.expose()["brokers"][0], "kafka:9092");
    let ConnectionSpec::Consumer { from_beginning, .. } = descriptor.spec else {
        panic!("expected consumer spec");
    };
    assert!(from_beginning);

    assert!(store.get("producer:f9:c9").await.expect("get").is_none());
}

#[tokio::test]
async fn external_writes_are_observed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    std::fs::write(&path, REGISTRY).expect("write registry");
    let store = FileStateStore::new(&path);
    assert_eq!(store.enumerate_all().await.expect("enumerate").len(), 2);

    std::fs::write(&path, "{}").expect("rewrite registry");
    assert!(store.enumerate_all().await.expect("enumerate").is_empty());
    assert!(store.get("producer:f1:c2").await.expect("get").is_none());
}

#[tokio::test]
async fn missing_or_blank_file_is_an_empty_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    let store = FileStateStore::new(&path);
    assert!(store.enumerate_all().await.expect("enumerate").is_empty());

    std::fs::write(&path, "  \n").expect("write blank");
    assert!(store.enumerate_all().await.expect("enumerate").is_empty());
}

#[tokio::test]
async fn corrupt_file_is_unreachable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    std::fs::write(&path, "{ not json").expect("write corrupt");
    let store = FileStateStore::new(&path);

    let err = store.enumerate_all().await.expect_err("should fail");
    assert!(matches!(err, StoreError::Unreachable(_)));
}

#[tokio::test]
async fn malformed_value_is_returned_not_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    std::fs::write(
        &path,
        r#"{"consumer:f1:c1": {"topics": ["orders"], "groupId": "g1"},
            "producer:f1:c2": {},
            "producer:f1:c3": "garbage"}"#,
    )
    .expect("write registry");
    let store = FileStateStore::new(&path);

    let entries = store.enumerate_all().await.expect("enumerate");
    assert_eq!(entries.len(), 3);
    let bad = store
        .get("producer:f1:c3")
        .await
        .expect("get")
        .expect("registered");
    assert!(ConnectionDescriptor::from_value("producer:f1:c3", &bad).is_err());
    let producer = store
        .get("producer:f1:c2")
        .await
        .expect("get")
        .expect("registered");
    assert!(ConnectionDescriptor::from_value("producer:f1:c2", &producer).is_ok());
}
