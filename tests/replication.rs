use std::sync::{Arc, Barrier};
use std::time::Duration;

use docview::manager::ReplicatorState;
use docview::{Manager, Status};
use serde_json::json;

#[tokio::test]
async fn equivalent_properties_share_one_active_replicator() {
    let m = Manager::in_memory().unwrap();
    m.database_named("notes", false).unwrap();

    let a = m
        .replicator_with_properties(&json!({
            "source": "notes",
            "target": "HTTPS://Sync.Example.com:443/notes/",
            "doc_ids": ["b", "a"]
        }))
        .unwrap();
    let b = m
        .replicator_with_properties(&json!({
            "doc_ids": ["a", "b", "a"],
            "target": {"url": "https://sync.example.com/notes"},
            "source": "notes",
            "create_target": false,
            "extra": "ignored"
        }))
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(m.active_replicators().len(), 1);

    // 不同配置是不同身份
    let c = m
        .replicator_with_properties(&json!({
            "source": "notes",
            "target": "https://sync.example.com/notes",
            "continuous": true
        }))
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(m.active_replicators().len(), 2);
}

#[tokio::test]
async fn stopped_replicator_is_replaced_by_a_fresh_instance() {
    let m = Manager::in_memory().unwrap();
    m.database_named("notes", false).unwrap();
    let props = json!({"source": "notes", "target": "http://remote/notes"});

    let first = m.replicator_with_properties(&props).unwrap();
    first.stop();
    tokio::time::timeout(Duration::from_secs(5), first.wait_stopped())
        .await
        .unwrap();
    assert_eq!(first.state(), ReplicatorState::Stopped);

    let second = m.replicator_with_properties(&props).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_active());

    let cancelled = m.cancel_replication(&props).unwrap();
    assert!(Arc::ptr_eq(&second, &cancelled));
    let e = m.cancel_replication(&props).unwrap_err();
    assert_eq!(e.status(), Status::NotFound);
}

#[tokio::test]
async fn invalid_properties_surface_bad_request() {
    let m = Manager::in_memory().unwrap();
    m.database_named("notes", false).unwrap();
    let e = m
        .replicator_with_properties(&json!({
            "source": "notes",
            "target": "http://remote/notes",
            "filter": "app/by_owner",
            "doc_ids": ["a"]
        }))
        .unwrap_err();
    assert_eq!(e.status(), Status::BadRequest);
    assert!(m.active_replicators().is_empty());

    let e = m
        .validate_replicator_properties(&json!({"source": "missing", "target": "http://r/db"}))
        .unwrap_err();
    assert_eq!(e.status(), Status::NotFound);
}

#[tokio::test]
async fn manager_close_stops_replicators() {
    let m = Manager::in_memory().unwrap();
    m.database_named("notes", false).unwrap();
    let r = m
        .replicator_with_properties(&json!({"source": "http://r/notes", "target": "notes"}))
        .unwrap();
    m.close();
    assert!(!r.is_active());
    assert!(m.active_replicators().is_empty());
    assert!(m
        .replicator_with_properties(&json!({"source": "http://r/notes", "target": "notes"}))
        .is_err());
}

/// 两个线程同时以等价配置请求，只能得到同一个实例
fn race_for_replicator(m: &Manager, left: serde_json::Value, right: serde_json::Value) {
    let barrier = Barrier::new(2);
    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| {
            barrier.wait();
            m.replicator_with_properties(&left).unwrap()
        });
        let b = s.spawn(|| {
            barrier.wait();
            m.replicator_with_properties(&right).unwrap()
        });
        (a.join().unwrap(), b.join().unwrap())
    });
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn concurrent_equivalent_requests_share_one_replicator() {
    let m = Manager::in_memory().unwrap();
    m.database_named("notes", false).unwrap();
    for i in 0..20 {
        race_for_replicator(
            &m,
            json!({"source": "notes", "target": format!("https://sync.example.com/n{}", i)}),
            json!({"target": format!("HTTPS://SYNC.example.com:443/n{}/", i), "source": "notes"}),
        );
    }
    assert_eq!(m.active_replicators().len(), 20);
}

#[test]
fn concurrent_pulls_create_the_target_once() {
    let m = Manager::in_memory().unwrap();
    for i in 0..10 {
        let local = format!("inbox{}", i);
        race_for_replicator(
            &m,
            json!({"source": "http://r/notes", "target": local, "create_target": true}),
            json!({"create_target": true, "target": local, "source": "http://r/notes/"}),
        );
        assert!(m.all_open_databases().iter().any(|d| d.name() == local));
    }
    assert_eq!(m.active_replicators().len(), 10);
    m.close();
}
