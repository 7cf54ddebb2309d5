use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;

use super::compiler::SIMPLE_LANGUAGE;
use super::file::FileViewStorage;
use super::function::{
    compile_definition, InvalidationPolicy, MapFunction, ReduceFunction, ViewDefinition,
};
use super::group::{group_name, same_group};
use super::memory::MemoryViewStorage;
use super::storage::ViewStorage;
use super::updater;
use crate::core::{
    Collation, Result, SequenceNumber, Status, StorageType, ViewError, DESIGN_DOC_PREFIX,
};
use crate::event::{ViewChange, ViewNotifier};
use crate::manager::Database;
use crate::query::engine;
use crate::query::{IndexUpdateMode, QueryEnumerator, QueryOptions, RowLink};

const MAX_VIEW_NAME_BYTES: usize = 255;

pub fn validate_view_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.len() > MAX_VIEW_NAME_BYTES
        || name.starts_with('/')
        || name.ends_with('/')
        || name.chars().any(char::is_control);
    if bad {
        return Err(ViewError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// 一个命名索引：map / 可选 reduce / collation，弱引用所属数据库，独占自己的存储
pub struct View {
    name: String,
    database: Weak<Database>,
    storage: RwLock<Option<Arc<dyn ViewStorage>>>,
    definition: RwLock<Option<ViewDefinition>>,
    notifier: ViewNotifier,
    /// 本视图发出的行回指；close 时逐个清空
    links: Mutex<Vec<Weak<RowLink>>>,
}

impl View {
    /// 打开（或创建）命名视图；不触发索引
    pub fn open(database: &Arc<Database>, name: &str, create_if_missing: bool) -> Result<Arc<View>> {
        database.ensure_open()?;
        validate_view_name(name)?;
        if let Some(v) = database.registered_view(name) {
            return Ok(v);
        }

        let storage: Arc<dyn ViewStorage> = match database.options().storage_type {
            StorageType::Memory => {
                if !create_if_missing {
                    return Err(ViewError::NotFound(format!("view {:?}", name)));
                }
                Arc::new(MemoryViewStorage::new(name, Collation::default()))
            }
            StorageType::File => {
                let path = database.view_index_path(name);
                if !create_if_missing && !FileViewStorage::exists_at(&path) {
                    return Err(ViewError::NotFound(format!("view {:?}", name)));
                }
                Arc::new(FileViewStorage::open(name, path, Collation::default())?)
            }
        };

        let current = database.last_sequence();
        let indexed = storage.last_sequence_indexed();
        if indexed > current {
            tracing::warn!(
                "View {} indexed up to {} but database {} is at {}; resetting index",
                name,
                indexed,
                database.name(),
                current
            );
            storage.delete_index()?;
        }

        // 之前绑定过的定义（视图或数据库重开）
        let definition = database.shared().view_definition(database.name(), name);
        let view = Arc::new(View {
            name: name.to_string(),
            database: Arc::downgrade(database),
            storage: RwLock::new(Some(storage)),
            definition: RwLock::new(definition),
            notifier: ViewNotifier::new(),
            links: Mutex::new(Vec::new()),
        });
        let winner = database.register_view(view.clone());
        if Arc::ptr_eq(&winner, &view) {
            tracing::info!("View opened: {}/{}", database.name(), name);
        } else if let Some(s) = view.storage.write().take() {
            s.close();
        }
        Ok(winner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所属数据库；已关闭或已释放时 DatabaseClosed
    pub fn database(&self) -> Result<Arc<Database>> {
        match self.database.upgrade() {
            Some(db) if db.is_open() => Ok(db),
            Some(db) => Err(ViewError::DatabaseClosed(db.name().to_string())),
            None => Err(ViewError::DatabaseClosed(String::new())),
        }
    }

    pub fn storage(&self) -> Result<Arc<dyn ViewStorage>> {
        self.storage
            .read()
            .clone()
            .ok_or_else(|| ViewError::NotFound(format!("view {:?} is closed", self.name)))
    }

    pub fn is_closed(&self) -> bool {
        self.storage.read().is_none()
    }

    /// 当前绑定的 map（纯访问，不编译）
    pub fn registered_map(&self) -> Option<Arc<dyn MapFunction>> {
        self.definition.read().as_ref().map(|d| d.map.clone())
    }

    pub fn reduce_function(&self) -> Option<Arc<dyn ReduceFunction>> {
        self.definition.read().as_ref().and_then(|d| d.reduce.clone())
    }

    pub fn definition(&self) -> Option<ViewDefinition> {
        self.definition.read().clone()
    }

    /// 已绑定的 map；未绑定时从设计文档编译并绑定
    pub fn resolve_map(&self) -> Result<Arc<dyn MapFunction>> {
        if let Some(m) = self.registered_map() {
            return Ok(m);
        }
        self.compile_from_design_doc()?;
        self.registered_map()
            .ok_or_else(|| ViewError::NotFound(format!("view {:?} has no map function", self.name)))
    }

    /// 绑定定义；版本变化且索引非空时按策略失效或拒绝
    pub fn set_definition(&self, definition: ViewDefinition, policy: InvalidationPolicy) -> Result<()> {
        let db = self.database()?;
        let storage = self.storage()?;
        {
            let _group = db.group_locks().lock_views([self.name.as_str()]);
            let stored = storage.map_version();
            if stored.as_deref() != Some(definition.version.as_str()) {
                let populated = storage.total_rows() > 0 || storage.last_sequence_indexed() > 0;
                if populated {
                    if policy == InvalidationPolicy::Reject {
                        return Err(ViewError::Conflict(format!(
                            "view {:?} has index for map version {:?}",
                            self.name, stored
                        )));
                    }
                    tracing::info!(
                        "Map version of {} changed ({:?} -> {}); invalidating index",
                        self.name,
                        stored,
                        definition.version
                    );
                    let mut txn = storage.begin_transaction()?;
                    txn.reset_index();
                    txn.set_map_version(Some(definition.version.clone()));
                    if let Err(e) = txn.prepare() {
                        txn.rollback();
                        return Err(e);
                    }
                    txn.commit()?;
                } else {
                    storage.set_map_version(Some(definition.version.clone()))?;
                }
            }
            // 与索引重置在同一把组锁内换 map，更新器在锁内读到的 map 与索引版本一致
            db.shared()
                .set_view_definition(db.name(), &self.name, definition.clone());
            *self.definition.write() = Some(definition);
        }
        Ok(())
    }

    /// 用共享注册表里 `language` 的编译器编译 `{map, reduce, options.collation}`
    pub fn compile_from_properties(&self, properties: &Value, language: Option<&str>) -> Result<()> {
        let language = language.unwrap_or(SIMPLE_LANGUAGE);
        let db = self.database()?;
        let compiler = db.shared().compiler(language).ok_or_else(|| {
            ViewError::compile(language, format!("unsupported view language {:?}", language))
        })?;
        let map_src = properties
            .get("map")
            .and_then(Value::as_str)
            .ok_or_else(|| ViewError::compile(language, "view properties lack a map source"))?;
        let reduce_src = match properties.get("reduce") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                return Err(ViewError::compile(
                    language,
                    format!("reduce source must be a string, got {}", other),
                ))
            }
        };
        if let Some(c) = properties.pointer("/options/collation").and_then(Value::as_str) {
            let collation = Collation::parse(c).ok_or_else(|| {
                ViewError::compile(language, format!("unknown collation {:?}", c))
            })?;
            self.set_collation(collation)?;
        }
        let definition = compile_definition(compiler.as_ref(), map_src, reduce_src)?;
        self.set_definition(definition, InvalidationPolicy::Invalidate)
    }

    /// 视图 `g/v` 从 `_design/g` 的 `views.v` 编译
    pub fn compile_from_design_doc(&self) -> Result<()> {
        let Some((group, view)) = self.name.split_once('/') else {
            return Err(ViewError::NotFound(format!(
                "view {:?} has no design document",
                self.name
            )));
        };
        let db = self.database()?;
        let doc_id = format!("{}{}", DESIGN_DOC_PREFIX, group);
        let doc = db
            .document(&doc_id)
            .ok_or_else(|| ViewError::NotFound(format!("design document {:?}", doc_id)))?;
        let properties = doc
            .body
            .get("views")
            .and_then(|v| v.get(view))
            .ok_or_else(|| ViewError::NotFound(format!("view {:?} in {:?}", view, doc_id)))?;
        let language = doc.body.get("language").and_then(Value::as_str);
        self.compile_from_properties(properties, language)
    }

    pub fn collation(&self) -> Result<Collation> {
        Ok(self.storage()?.collation())
    }

    /// 改变 collation 使索引失效
    pub fn set_collation(&self, collation: Collation) -> Result<()> {
        let db = self.database()?;
        let storage = self.storage()?;
        let _group = db.group_locks().lock_views([self.name.as_str()]);
        if storage.collation() != collation {
            tracing::info!(
                "Collation of {} changed ({} -> {}); invalidating index",
                self.name,
                storage.collation().as_str(),
                collation.as_str()
            );
            storage.set_collation(collation)?;
        }
        Ok(())
    }

    /// 解除 map 绑定（保留已有行）
    pub fn forget_map(&self) {
        let Some(db) = self.database.upgrade() else {
            self.definition.write().take();
            return;
        };
        let _group = db.group_locks().lock_views([self.name.as_str()]);
        self.definition.write().take();
        db.shared().forget_view_definition(db.name(), &self.name);
    }

    /// 释放存储、清空本视图发出的所有行回指、从数据库注销
    pub fn close(&self) {
        let Some(storage) = self.storage.write().take() else {
            return;
        };
        storage.close();
        self.detach_rows();
        if let Some(db) = self.database.upgrade() {
            db.unregister_view(self);
        }
        tracing::info!("View closed: {}", self.name);
    }

    pub(crate) fn detach_rows(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        for l in links.iter().filter_map(Weak::upgrade) {
            l.detach();
        }
    }

    /// 同组的所有已打开视图（含自身），按名字排序
    pub fn views_in_group(&self) -> Result<Vec<Arc<View>>> {
        let db = self.database()?;
        Ok(db
            .open_views()
            .into_iter()
            .filter(|v| same_group(&v.name, &self.name))
            .collect())
    }

    pub fn group(&self) -> &str {
        group_name(&self.name)
    }

    pub fn total_rows(&self) -> Result<usize> {
        Ok(self.storage()?.total_rows())
    }

    pub fn last_sequence_indexed(&self) -> Result<SequenceNumber> {
        Ok(self.storage()?.last_sequence_indexed())
    }

    pub fn last_sequence_changed_at(&self) -> Result<SequenceNumber> {
        Ok(self.storage()?.last_sequence_changed_at())
    }

    pub fn is_stale(&self) -> Result<bool> {
        Ok(self.last_sequence_indexed()? < self.database()?.last_sequence())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewChange> {
        self.notifier.subscribe()
    }

    pub(crate) fn notify(&self, change: ViewChange) {
        self.notifier.publish(change);
    }

    /// 删除所有行并把序列号归零
    pub fn delete_index(&self) -> Result<()> {
        let db = self.database()?;
        let storage = self.storage()?;
        {
            let _group = db.group_locks().lock_views([self.name.as_str()]);
            storage.delete_index()?;
        }
        self.notify(ViewChange {
            view: self.name.clone(),
            last_sequence_indexed: 0,
            last_sequence_changed_at: 0,
        });
        Ok(())
    }

    pub fn update_index(self: &Arc<Self>) -> Result<Status> {
        updater::update_index(self)
    }

    pub fn update_index_alone(self: &Arc<Self>) -> Result<Status> {
        updater::update_index_alone(self)
    }

    /// 在当前快照上查询，从不触发索引
    pub fn query(&self, options: &QueryOptions) -> Result<QueryEnumerator> {
        let db = self.database()?;
        let snapshot = self.storage()?.snapshot();
        let link = RowLink::new(db.clone(), &self.name);
        {
            let mut links = self.links.lock();
            links.retain(|l| l.strong_count() > 0);
            links.push(Arc::downgrade(&link));
        }
        engine::execute(&db, snapshot, self.reduce_function(), options, link)
    }

    /// 按 `index_update_mode` 决定更新时机后查询
    pub fn run(self: &Arc<Self>, options: &QueryOptions) -> Result<QueryEnumerator> {
        match options.index_update_mode {
            IndexUpdateMode::Before => {
                self.update_index()?;
                self.query(options)
            }
            IndexUpdateMode::Never => self.query(options),
            IndexUpdateMode::After => {
                let rows = self.query(options)?;
                if let Err(e) = self.update_index() {
                    tracing::warn!("Deferred index update of {} failed: {}", self.name, e);
                }
                Ok(rows)
            }
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("definition", &*self.definition.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_names_are_validated() {
        for ok in ["app/by_type", "solo", "a/b/c", "名字/视图"] {
            assert!(validate_view_name(ok).is_ok(), "{}", ok);
        }
        let long = "x".repeat(256);
        for bad in ["", "/lead", "trail/", "tab\tname", long.as_str()] {
            assert!(matches!(validate_view_name(bad), Err(ViewError::InvalidName(_))), "{:?}", bad);
        }
    }
}
