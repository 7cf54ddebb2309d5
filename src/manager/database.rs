use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::shared::Shared;
use crate::core::{
    AdaptiveScheduler, Change, Document, IndexerOptions, ManagerOptions, Result, SequenceNumber,
    StorageType, ViewError,
};
use crate::event::{ChangeSource, DocumentStore};
use crate::index::{GroupLocks, View};
use crate::stats::{IndexReport, UpdateStats, ViewSummary};

const DOCUMENT_LOG: &str = "docs.wal";
const VIEWS_DIR: &str = "views";

/// 一个打开的数据库：文档存储 + 已打开视图注册表 + 每组索引锁
pub struct Database {
    name: String,
    path: PathBuf,
    options: ManagerOptions,
    shared: Arc<Shared>,
    store: DocumentStore,
    views: DashMap<String, Arc<View>>,
    group_locks: GroupLocks,
    scheduler: AdaptiveScheduler,
    report: Mutex<IndexReport>,
    open: AtomicBool,
}

impl Database {
    /// 打开（或创建）数据库。文件后端时 `path` 是目录，内含文档日志与 `views/`
    pub fn open(
        name: &str,
        path: PathBuf,
        options: &ManagerOptions,
        shared: Arc<Shared>,
    ) -> Result<Arc<Database>> {
        let store = match options.storage_type {
            StorageType::Memory => DocumentStore::in_memory(),
            StorageType::File => {
                if !options.read_only {
                    std::fs::create_dir_all(path.join(VIEWS_DIR))?;
                } else if !path.is_dir() {
                    return Err(ViewError::NotFound(format!("database {:?}", name)));
                }
                DocumentStore::open_persistent(path.join(DOCUMENT_LOG), options.read_only)?
            }
        };
        tracing::info!(
            "Database opened: {} ({}, last_seq={})",
            name,
            options.storage_type.as_str(),
            store.last_sequence()
        );
        Ok(Arc::new(Database {
            name: name.to_string(),
            path,
            options: options.clone(),
            shared,
            store,
            views: DashMap::new(),
            group_locks: GroupLocks::new(),
            scheduler: AdaptiveScheduler::new(&options.indexer),
            report: Mutex::new(IndexReport::new(name)),
            open: AtomicBool::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn indexer_options(&self) -> &IndexerOptions {
        &self.options.indexer
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ViewError::DatabaseClosed(self.name.clone()))
        }
    }

    // ---- 文档 ----

    pub fn last_sequence(&self) -> SequenceNumber {
        self.store.last_sequence()
    }

    pub fn document_count(&self) -> usize {
        self.store.document_count()
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.store.document(id)
    }

    pub fn put_document(&self, id: &str, body: Value) -> Result<Document> {
        self.ensure_open()?;
        self.store.put(id, body)
    }

    pub fn delete_document(&self, id: &str) -> Result<Document> {
        self.ensure_open()?;
        self.store.delete(id)
    }

    pub fn changes_since(&self, since: SequenceNumber, upto: SequenceNumber) -> Vec<Change> {
        self.store.changes_since(since, upto)
    }

    /// `(current, (since, current] 的 changes)`，在同一把读锁下取得
    pub fn changes_to_current(&self, since: SequenceNumber) -> (SequenceNumber, Vec<Change>) {
        self.store.changes_to_current(since)
    }

    pub fn change_source(&self) -> &dyn ChangeSource {
        &self.store
    }

    // ---- 视图 ----

    /// 文件后端下视图快照位置；`/` 换成 `:` 保持单层目录
    pub fn view_index_path(&self, view: &str) -> PathBuf {
        self.path
            .join(VIEWS_DIR)
            .join(format!("{}.idx", view.replace('/', ":")))
    }

    pub fn registered_view(&self, name: &str) -> Option<Arc<View>> {
        self.views.get(name).map(|v| v.clone())
    }

    /// 注册新打开的视图；同名已存在时返回先到者
    pub(crate) fn register_view(&self, view: Arc<View>) -> Arc<View> {
        self.views
            .entry(view.name().to_string())
            .or_insert(view)
            .clone()
    }

    pub(crate) fn unregister_view(&self, view: &View) {
        self.views
            .remove_if(view.name(), |_, v| std::ptr::eq(Arc::as_ptr(v), view));
    }

    /// 已打开视图，按名字排序
    pub fn open_views(&self) -> Vec<Arc<View>> {
        let mut v: Vec<Arc<View>> = self.views.iter().map(|e| e.value().clone()).collect();
        v.sort_by(|a, b| a.name().cmp(b.name()));
        v
    }

    /// 打开或创建视图
    pub fn view_named(self: &Arc<Self>, name: &str) -> Result<Arc<View>> {
        View::open(self, name, true)
    }

    /// 只打开已存在的视图
    pub fn existing_view(self: &Arc<Self>, name: &str) -> Result<Option<Arc<View>>> {
        match View::open(self, name, false) {
            Ok(v) => Ok(Some(v)),
            Err(ViewError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn group_locks(&self) -> &GroupLocks {
        &self.group_locks
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    // ---- 统计 ----

    pub(crate) fn record_pass(&self, stats: &UpdateStats) {
        self.report.lock().record_pass(stats);
    }

    pub(crate) fn record_not_modified(&self) {
        self.report.lock().record_not_modified();
    }

    pub(crate) fn record_failure(&self) {
        self.report.lock().record_failure();
    }

    pub fn report(&self) -> IndexReport {
        let mut report = self.report.lock().clone();
        report.last_sequence = self.last_sequence();
        report.document_count = self.document_count();
        for v in self.open_views() {
            let Ok(storage) = v.storage() else {
                continue;
            };
            report.views.insert(
                v.name().to_string(),
                ViewSummary {
                    total_rows: storage.total_rows(),
                    last_sequence_indexed: storage.last_sequence_indexed(),
                    last_sequence_changed_at: storage.last_sequence_changed_at(),
                },
            );
        }
        report
    }

    /// 重写文档日志，只保留每个文档的最新修订
    pub fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.compact_log()
    }

    /// 关闭所有视图（其发出的行随之失联）；幂等
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        // View::close 会回调 unregister_view，先收集再关
        for v in self.open_views() {
            v.close();
        }
        tracing::info!("Database closed: {}", self.name);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}
