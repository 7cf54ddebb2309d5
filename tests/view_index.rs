//! 跨模块行为：增量更新、分组顺带更新、快照隔离、删除、reduce、行失联。

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docview::index::{Emitter, MapFunction, UpdateControl};
use docview::{
    Database, IndexUpdateMode, InvalidationPolicy, Manager, ManagerOptions, QueryOptions, Status,
    View, ViewDefinition, ViewError,
};
use serde_json::{json, Value};

fn unique_tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("docview-it-{}-{}", tag, nanos))
}

fn setup() -> (Manager, Arc<Database>) {
    let m = Manager::in_memory().unwrap();
    let db = m.database_named("db", false).unwrap();
    (m, db)
}

fn define(view: &View, map: &str) {
    view.compile_from_properties(&json!({ "map": map }), None)
        .unwrap();
}

fn pairs(view: &View, options: &QueryOptions) -> Vec<(Value, Value)> {
    view.query(options)
        .unwrap()
        .map(|r| (r.key().clone(), r.value().clone()))
        .collect()
}

/// map 调用计数器
fn counting_map(counter: Arc<AtomicUsize>) -> Arc<dyn MapFunction> {
    Arc::new(move |doc: &Value, e: &mut Emitter| -> docview::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        e.emit(doc["type"].clone(), doc["_id"].clone());
        Ok(())
    })
}

/// 把每个文档映射到固定 key，用来区分 map 版本
fn tagging_map(tag: &'static str) -> Arc<dyn MapFunction> {
    Arc::new(move |doc: &Value, e: &mut Emitter| -> docview::Result<()> {
        e.emit(json!(tag), doc["_id"].clone());
        Ok(())
    })
}

#[test]
fn example_scenario() {
    let (_m, db) = setup();
    db.put_document("a", json!({"id": "a", "type": "x"})).unwrap();
    db.put_document("b", json!({"id": "b", "type": "x"})).unwrap();
    let view = db.view_named("app/by_type").unwrap();
    define(&view, "emit(doc.type, doc.id)");

    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(
        pairs(&view, &QueryOptions::new()),
        vec![(json!("x"), json!("a")), (json!("x"), json!("b"))]
    );
    assert_eq!(
        pairs(&view, &QueryOptions::new().limit(1)),
        vec![(json!("x"), json!("a"))]
    );
}

#[test]
fn second_update_is_not_modified() {
    let (_m, db) = setup();
    for i in 0..10 {
        db.put_document(&format!("d{}", i), json!({"type": i % 3})).unwrap();
    }
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");

    assert_eq!(view.update_index().unwrap(), Status::Ok);
    let before = pairs(&view, &QueryOptions::new());
    assert_eq!(view.update_index().unwrap(), Status::NotModified);
    assert_eq!(pairs(&view, &QueryOptions::new()), before);
    assert_eq!(before.len(), 10);

    let report = db.report();
    assert_eq!(report.passes, 1);
    assert_eq!(report.not_modified, 1);
    assert_eq!(report.views["app/v"].total_rows, 10);
}

#[test]
fn last_sequence_indexed_is_monotonic() {
    let (_m, db) = setup();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc._id, 1)");

    let mut last = 0;
    for round in 0..5 {
        db.put_document(&format!("d{}", round), json!({})).unwrap();
        if round % 2 == 0 {
            db.put_document("shared", json!({"round": round})).unwrap();
        }
        view.update_index().unwrap();
        let now = view.last_sequence_indexed().unwrap();
        assert!(now >= last);
        assert_eq!(now, db.last_sequence());
        last = now;
    }
    assert!(!view.is_stale().unwrap());
}

#[test]
fn updating_one_view_updates_its_group() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x", "n": 1})).unwrap();
    let a = db.view_named("app/a").unwrap();
    let b = db.view_named("app/b").unwrap();
    let other = db.view_named("other/c").unwrap();
    define(&a, "emit(doc.type, null)");
    define(&b, "emit(doc.n, null)");
    define(&other, "emit(doc.n, null)");

    assert_eq!(a.update_index().unwrap(), Status::Ok);
    assert_eq!(a.last_sequence_indexed().unwrap(), 1);
    assert_eq!(b.last_sequence_indexed().unwrap(), 1);
    assert_eq!(b.total_rows().unwrap(), 1);
    assert_eq!(other.last_sequence_indexed().unwrap(), 0);

    db.put_document("b", json!({"type": "y", "n": 2})).unwrap();
    assert_eq!(a.update_index_alone().unwrap(), Status::Ok);
    assert_eq!(b.last_sequence_indexed().unwrap(), 1);

    assert_eq!(
        docview::index::update_indexes(&[b.clone(), other.clone()]).unwrap(),
        Status::Ok
    );
    assert_eq!(other.total_rows().unwrap(), 2);
    assert_eq!(b.total_rows().unwrap(), 2);
}

#[test]
fn in_flight_queries_see_their_snapshot() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x"})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, doc._id)");
    view.update_index().unwrap();

    let old = view.query(&QueryOptions::new()).unwrap();
    assert!(!old.is_stale());

    db.put_document("b", json!({"type": "x"})).unwrap();
    db.delete_document("a").unwrap();
    view.update_index().unwrap();

    assert!(old.is_stale());
    let old_ids: Vec<Option<String>> = old.map(|r| r.doc_id().map(str::to_string)).collect();
    assert_eq!(old_ids, vec![Some("a".to_string())]);

    let new_ids: Vec<Value> = pairs(&view, &QueryOptions::new())
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(new_ids, vec![json!("b")]);
}

#[test]
fn deletions_remove_rows_without_mapping() {
    let (_m, db) = setup();
    let counter = Arc::new(AtomicUsize::new(0));
    db.put_document("a", json!({"type": "x"})).unwrap();
    db.put_document("b", json!({"type": "y"})).unwrap();
    let view = db.view_named("app/v").unwrap();
    view.set_definition(
        ViewDefinition::new(counting_map(counter.clone()), "count-v1"),
        InvalidationPolicy::Invalidate,
    )
    .unwrap();

    view.update_index().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    db.delete_document("a").unwrap();
    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(pairs(&view, &QueryOptions::new()), vec![(json!("y"), json!("b"))]);
    assert_eq!(view.last_sequence_changed_at().unwrap(), 3);
}

#[test]
fn design_documents_define_views_and_are_not_mapped() {
    let (_m, db) = setup();
    db.put_document(
        "_design/app",
        json!({"views": {"by_type": {"map": "emit(doc.type, 1)", "reduce": "_count"}}}),
    )
    .unwrap();
    db.put_document("a", json!({"type": "x"})).unwrap();
    db.put_document("b", json!({"type": "y"})).unwrap();
    db.put_document("c", json!({"type": "x"})).unwrap();

    let view = db.view_named("app/by_type").unwrap();
    assert!(view.registered_map().is_none());
    view.update_index().unwrap();
    assert!(view.registered_map().is_some());
    assert_eq!(view.total_rows().unwrap(), 3);

    // reduce 默认开启
    assert_eq!(pairs(&view, &QueryOptions::new()), vec![(Value::Null, json!(3))]);
    assert_eq!(
        pairs(&view, &QueryOptions::new().group(true)),
        vec![(json!("x"), json!(2)), (json!("y"), json!(1))]
    );
    assert_eq!(
        pairs(&view, &QueryOptions::new().reduce(false).keys(vec![json!("y")])),
        vec![(json!("y"), json!(1))]
    );
}

#[test]
fn map_errors_skip_the_document() {
    let (_m, db) = setup();
    db.put_document("good", json!({"n": {"x": 1}})).unwrap();
    db.put_document("bad", json!({"n": 3})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.n.x, null)");

    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(view.total_rows().unwrap(), 1);
    assert_eq!(db.report().totals.map_errors, 1);
}

#[test]
fn cancelled_update_rolls_back() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x"})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");

    let control = UpdateControl::new();
    control.cancel();
    let err = docview::index::update_index_with(&view, &control).unwrap_err();
    assert!(matches!(err, ViewError::Interrupted));
    assert_eq!(err.status(), Status::Unavailable);
    assert_eq!(view.last_sequence_indexed().unwrap(), 0);
    assert_eq!(view.total_rows().unwrap(), 0);

    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(view.total_rows().unwrap(), 1);
}

#[test]
fn changing_the_map_invalidates_the_index() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x", "n": 1})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");
    view.update_index().unwrap();
    assert_eq!(view.last_sequence_indexed().unwrap(), 1);

    // 同一源码不失效
    define(&view, "emit(doc.type, null)");
    assert_eq!(view.last_sequence_indexed().unwrap(), 1);

    let counter = Arc::new(AtomicUsize::new(0));
    let err = view
        .set_definition(
            ViewDefinition::new(counting_map(counter.clone()), "v2"),
            InvalidationPolicy::Reject,
        )
        .unwrap_err();
    assert!(matches!(err, ViewError::Conflict(_)));

    define(&view, "emit(doc.n, null)");
    assert_eq!(view.last_sequence_indexed().unwrap(), 0);
    assert_eq!(view.total_rows().unwrap(), 0);
    view.update_index().unwrap();
    assert_eq!(pairs(&view, &QueryOptions::new()), vec![(json!(1), Value::Null)]);
}

#[test]
fn rows_detach_when_the_view_closes() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x"})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");
    view.update_index().unwrap();

    let rows = view
        .query(&QueryOptions::new().include_docs(true))
        .unwrap()
        .into_rows();
    let plain = view.query(&QueryOptions::new()).unwrap().into_rows();
    assert_eq!(rows[0].view_name().as_deref(), Some("app/v"));
    assert!(plain[0].document().is_some());

    view.close();
    assert!(rows[0].is_detached());
    assert!(rows[0].database().is_none());
    // 预取的文档在失联后仍可读
    assert_eq!(rows[0].document().unwrap()["type"], json!("x"));
    assert!(plain[0].document().is_none());
    assert_eq!(rows[0].key(), &json!("x"));
}

#[test]
fn closed_database_fails_fast() {
    let (m, db) = setup();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");
    m.close_database("db").unwrap();
    assert!(view.update_index().is_err());
    assert!(matches!(view.database(), Err(ViewError::DatabaseClosed(_))));
}

#[test]
fn run_honors_update_mode() {
    let (_m, db) = setup();
    db.put_document("a", json!({"type": "x"})).unwrap();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");

    let never = QueryOptions::new().index_update_mode(IndexUpdateMode::Never);
    assert_eq!(view.run(&never).unwrap().count(), 0);

    let after = QueryOptions::new().index_update_mode(IndexUpdateMode::After);
    assert_eq!(view.run(&after).unwrap().count(), 0);
    assert_eq!(view.run(&never).unwrap().count(), 1);

    db.put_document("b", json!({"type": "y"})).unwrap();
    assert_eq!(view.run(&QueryOptions::new()).unwrap().count(), 2);
}

#[test]
fn change_notifications_follow_commits() {
    let (_m, db) = setup();
    let view = db.view_named("app/v").unwrap();
    define(&view, "emit(doc.type, null)");
    let mut rx = view.subscribe();

    db.put_document("a", json!({"type": "x"})).unwrap();
    view.update_index().unwrap();
    let change = rx.try_recv().unwrap();
    assert_eq!(change.view, "app/v");
    assert_eq!(change.last_sequence_indexed, 1);
    assert_eq!(change.last_sequence_changed_at, 1);

    assert_eq!(view.update_index().unwrap(), Status::NotModified);
    assert!(rx.try_recv().is_err());
}

#[test]
fn file_backed_index_survives_restart() {
    let dir = unique_tmp_dir("restart");
    {
        let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
        let db = m.database_named("db", false).unwrap();
        db.put_document("a", json!({"type": "x"})).unwrap();
        db.put_document("b", json!({"type": "y"})).unwrap();
        let view = db.view_named("app/v").unwrap();
        define(&view, "emit(doc.type, null)");
        view.update_index().unwrap();
        m.close();
    }

    let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
    let db = m.database_named("db", true).unwrap();
    let view = db.existing_view("app/v").unwrap().unwrap();
    assert_eq!(view.total_rows().unwrap(), 2);
    assert_eq!(view.last_sequence_indexed().unwrap(), 2);

    define(&view, "emit(doc.type, null)");
    assert_eq!(view.update_index().unwrap(), Status::NotModified);

    db.put_document("c", json!({"type": "z"})).unwrap();
    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(view.total_rows().unwrap(), 3);
}

#[test]
fn map_swap_queued_behind_an_update_never_mixes_versions() {
    let (_m, db) = setup();
    db.put_document("a", json!({})).unwrap();
    let view = db.view_named("app/v").unwrap();
    view.set_definition(
        ViewDefinition::new(tagging_map("old"), "v1"),
        InvalidationPolicy::Invalidate,
    )
    .unwrap();
    view.update_index().unwrap();
    db.put_document("b", json!({})).unwrap();

    // 先让换 map 排队，再让更新排队，然后一起放行
    let held = db.group_locks().lock_views(["app/v"]);
    std::thread::scope(|s| {
        let swap = s.spawn(|| {
            view.set_definition(
                ViewDefinition::new(tagging_map("new"), "v2"),
                InvalidationPolicy::Invalidate,
            )
        });
        std::thread::sleep(Duration::from_millis(50));
        let update = s.spawn(|| view.update_index());
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        swap.join().unwrap().unwrap();
        update.join().unwrap().unwrap();
    });

    // 无论谁先拿到锁，v2 下都不能留有旧 map 的行
    let rows = pairs(&view, &QueryOptions::new());
    assert!(rows.iter().all(|(k, _)| k == &json!("new")), "{:?}", rows);

    view.update_index().unwrap();
    assert_eq!(
        pairs(&view, &QueryOptions::new()),
        vec![(json!("new"), json!("a")), (json!("new"), json!("b"))]
    );
}

#[test]
fn failed_commit_keeps_every_view_at_its_sequence() {
    let dir = unique_tmp_dir("commit-fail");
    let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
    let db = m.database_named("db", false).unwrap();
    db.put_document("a", json!({"type": "x"})).unwrap();
    let first = db.view_named("app/first").unwrap();
    let second = db.view_named("app/second").unwrap();
    define(&first, "emit(doc.type, null)");
    define(&second, "emit(doc.type, null)");
    assert_eq!(first.update_index().unwrap(), Status::Ok);
    assert_eq!(second.last_sequence_indexed().unwrap(), 1);

    db.put_document("b", json!({"type": "y"})).unwrap();
    // 第二个视图的快照临时文件位置被目录占住，prepare 写不进去
    let blocker = PathBuf::from(format!(
        "{}.tmp",
        db.view_index_path("app/second").display()
    ));
    std::fs::create_dir_all(blocker.join("keep")).unwrap();

    assert!(first.update_index().is_err());
    assert_eq!(first.last_sequence_indexed().unwrap(), 1);
    assert_eq!(second.last_sequence_indexed().unwrap(), 1);
    assert_eq!(first.total_rows().unwrap(), 1);
    assert_eq!(second.total_rows().unwrap(), 1);

    std::fs::remove_dir_all(&blocker).unwrap();
    assert_eq!(first.update_index().unwrap(), Status::Ok);
    assert_eq!(first.last_sequence_indexed().unwrap(), 2);
    assert_eq!(second.last_sequence_indexed().unwrap(), 2);
    assert_eq!(second.total_rows().unwrap(), 2);
    m.close();
}

#[test]
fn index_ahead_of_its_database_is_reset_on_open() {
    let dir = unique_tmp_dir("ahead");
    let ahead = {
        let m = Manager::new(ManagerOptions::file_backed(dir.join("long"))).unwrap();
        let db = m.database_named("db", false).unwrap();
        for id in ["a", "b", "c"] {
            db.put_document(id, json!({"type": id})).unwrap();
        }
        let view = db.view_named("app/v").unwrap();
        define(&view, "emit(doc.type, null)");
        view.update_index().unwrap();
        assert_eq!(view.last_sequence_indexed().unwrap(), 3);
        let path = db.view_index_path("app/v");
        m.close();
        path
    };

    // 另一个只有一次写入的数据库拿到了领先的索引文件
    let m = Manager::new(ManagerOptions::file_backed(dir.join("short"))).unwrap();
    let db = m.database_named("db", false).unwrap();
    db.put_document("z", json!({"type": "z"})).unwrap();
    std::fs::copy(&ahead, db.view_index_path("app/v")).unwrap();

    let view = db.existing_view("app/v").unwrap().unwrap();
    assert_eq!(view.last_sequence_indexed().unwrap(), 0);
    assert_eq!(view.total_rows().unwrap(), 0);

    define(&view, "emit(doc.type, null)");
    assert_eq!(view.update_index().unwrap(), Status::Ok);
    assert_eq!(pairs(&view, &QueryOptions::new()), vec![(json!("z"), Value::Null)]);
}
