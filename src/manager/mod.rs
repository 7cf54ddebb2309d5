//! Manager：数据库注册表 + 复制任务去重。
//!
//! 注册表锁只包住 map 的查找 / 插入，打开数据库的 I/O 在锁外完成；
//! 复制任务的“查找同身份活动实例，否则创建并登记”在同一把锁内完成。

pub mod database;
pub mod replicator;
pub mod shared;

pub use database::Database;
pub use replicator::{
    identity_of, normalize_url, Direction, Endpoint, RemoteEndpoint, Replicator, ReplicatorConfig,
    ReplicatorState,
};
pub use shared::Shared;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

use crate::core::{ManagerOptions, Result, StorageType, ViewError};

const DATABASE_SUFFIX: &str = ".docview";

fn database_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_$()+/-]*$").ok())
        .as_ref()
}

pub fn is_valid_database_name(name: &str) -> bool {
    database_name_regex().is_some_and(|re| re.is_match(name))
}

pub struct Manager {
    options: ManagerOptions,
    shared: Arc<Shared>,
    databases: Mutex<HashMap<String, Arc<Database>>>,
    replicators: Mutex<Vec<Arc<Replicator>>>,
    handle: tokio::runtime::Handle,
    /// 构造时不在 tokio 上下文中则自带一个运行时
    owned_runtime: Mutex<Option<tokio::runtime::Runtime>>,
    closed: AtomicBool,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Result<Self> {
        options.validate()?;
        if options.storage_type == StorageType::File && !options.read_only {
            std::fs::create_dir_all(&options.directory)?;
        }
        let (handle, owned_runtime) = match tokio::runtime::Handle::try_current() {
            Ok(h) => (h, None),
            Err(_) => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("docview-replicator")
                    .enable_all()
                    .build()?;
                (rt.handle().clone(), Some(rt))
            }
        };
        tracing::info!(
            "Manager started: {} storage at {}",
            options.storage_type.as_str(),
            options.directory.display()
        );
        Ok(Self {
            options,
            shared: Arc::new(Shared::new()),
            databases: Mutex::new(HashMap::new()),
            replicators: Mutex::new(Vec::new()),
            handle,
            owned_runtime: Mutex::new(owned_runtime),
            closed: AtomicBool::new(false),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(ManagerOptions::in_memory())
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ViewError::DatabaseClosed("manager is closed".into()));
        }
        Ok(())
    }

    // ---- 数据库 ----

    /// `<directory>/<name 中 '/' 换成 ':'>.docview`
    pub fn path_for_database_named(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_database_name(name) {
            return Err(ViewError::InvalidName(name.to_string()));
        }
        Ok(self
            .options
            .directory
            .join(format!("{}{}", name.replace('/', ":"), DATABASE_SUFFIX)))
    }

    pub fn name_of_database_at_path(&self, path: &Path) -> Option<String> {
        let file = path.file_name()?.to_str()?;
        let name = file.strip_suffix(DATABASE_SUFFIX)?.replace(':', "/");
        is_valid_database_name(&name).then_some(name)
    }

    fn persisted(&self, path: &Path) -> bool {
        self.options.storage_type == StorageType::File && path.is_dir()
    }

    /// 已注册且打开的实例直接返回；否则在锁外打开再登记，竞争失败者拿到胜者实例
    pub fn database_named(&self, name: &str, must_exist: bool) -> Result<Arc<Database>> {
        self.ensure_open()?;
        let path = self.path_for_database_named(name)?;
        if let Some(db) = self.databases.lock().get(name).filter(|d| d.is_open()) {
            return Ok(db.clone());
        }

        if !self.persisted(&path) && (must_exist || self.options.read_only) {
            return Err(ViewError::NotFound(format!("database {:?}", name)));
        }
        let opened = Database::open(name, path, &self.options, self.shared.clone())?;

        let mut dbs = self.databases.lock();
        match dbs.get(name) {
            Some(existing) if existing.is_open() => {
                tracing::debug!("Lost open race for database {}; using the registered one", name);
                let winner = existing.clone();
                drop(dbs);
                opened.close();
                Ok(winner)
            }
            _ => {
                dbs.insert(name.to_string(), opened.clone());
                Ok(opened)
            }
        }
    }

    /// 从注册表移除；数据库必须已关闭，持久化数据不动
    pub fn forget(&self, database: &Database) -> Result<()> {
        if database.is_open() {
            return Err(ViewError::Conflict(format!(
                "database {:?} is still open",
                database.name()
            )));
        }
        let mut dbs = self.databases.lock();
        if dbs
            .get(database.name())
            .is_some_and(|d| std::ptr::eq(Arc::as_ptr(d), database))
        {
            dbs.remove(database.name());
        }
        Ok(())
    }

    pub fn close_database(&self, name: &str) -> Result<()> {
        let db = self
            .databases
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ViewError::NotFound(format!("database {:?}", name)))?;
        db.close();
        self.forget(&db)
    }

    /// 已打开的数据库，按名字排序
    pub fn all_open_databases(&self) -> Vec<Arc<Database>> {
        let mut v: Vec<Arc<Database>> = self
            .databases
            .lock()
            .values()
            .filter(|d| d.is_open())
            .cloned()
            .collect();
        v.sort_by(|a, b| a.name().cmp(b.name()));
        v
    }

    // ---- 复制 ----

    fn local_exists(&self, name: &str) -> Result<bool> {
        if self.databases.lock().get(name).is_some_and(|d| d.is_open()) {
            return Ok(true);
        }
        Ok(self.persisted(&self.path_for_database_named(name)?))
    }

    fn check_replicator(&self, properties: &Value) -> Result<ReplicatorConfig> {
        let config = ReplicatorConfig::parse(properties)?;
        let local = config.local_database();
        let may_create = config.direction() == Direction::Pull && config.create_target;
        if !may_create && !self.local_exists(local)? {
            return Err(ViewError::NotFound(format!("database {:?}", local)));
        }
        Ok(config)
    }

    /// 结构校验，不产生副作用
    pub fn validate_replicator_properties(&self, properties: &Value) -> Result<()> {
        self.check_replicator(properties).map(|_| ())
    }

    /// 同一规范形式最多一个活动实例；`cancel: true` 等价于 cancel_replication
    pub fn replicator_with_properties(&self, properties: &Value) -> Result<Arc<Replicator>> {
        self.ensure_open()?;
        let config = ReplicatorConfig::parse(properties)?;
        if config.cancel {
            return self.cancel_replication(properties);
        }
        let canonical = config.canonical();
        let identity = identity_of(&canonical);

        // 校验与建库会碰磁盘，放在复制表锁之外
        let config = self.check_replicator(properties)?;
        let creates_target = config.direction() == Direction::Pull && config.create_target;
        if creates_target {
            self.database_named(config.local_database(), false)?;
        }

        let mut reps = self.replicators.lock();
        self.ensure_open()?;
        reps.retain(|r| r.is_active());
        if let Some(r) = reps.iter().find(|r| r.matches(&canonical, identity)) {
            tracing::debug!("Reusing active replicator {:016x}", identity);
            return Ok(r.clone());
        }
        // 锁外建好的库可能已被并发关闭
        if creates_target
            && !self
                .databases
                .lock()
                .get(config.local_database())
                .is_some_and(|d| d.is_open())
        {
            return Err(ViewError::NotFound(format!(
                "database {:?}",
                config.local_database()
            )));
        }
        let r = Replicator::new(config);
        r.start(&self.handle);
        reps.push(r.clone());
        Ok(r)
    }

    pub fn active_replicators(&self) -> Vec<Arc<Replicator>> {
        let mut reps = self.replicators.lock();
        reps.retain(|r| r.is_active());
        reps.clone()
    }

    /// 停止匹配的活动复制任务；没有则 NotFound
    pub fn cancel_replication(&self, properties: &Value) -> Result<Arc<Replicator>> {
        let config = ReplicatorConfig::parse(properties)?;
        let canonical = config.canonical();
        let identity = identity_of(&canonical);

        let mut reps = self.replicators.lock();
        let pos = reps
            .iter()
            .position(|r| r.is_active() && r.matches(&canonical, identity))
            .ok_or_else(|| ViewError::NotFound("no matching active replication".into()))?;
        let r = reps.remove(pos);
        r.stop();
        Ok(r)
    }

    /// 拆除：停止复制任务，关闭并遗忘全部数据库；幂等
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reps = std::mem::take(&mut *self.replicators.lock());
        for r in &reps {
            r.stop();
        }
        let dbs: Vec<Arc<Database>> = self.databases.lock().drain().map(|(_, d)| d).collect();
        for db in &dbs {
            db.close();
            self.shared.forget_database(db.name());
        }
        tracing::info!(
            "Manager closed: {} databases, {} replicators",
            dbs.len(),
            reps.len()
        );
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
        if let Some(rt) = self.owned_runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("docview-mgr-{}-{}", tag, nanos))
    }

    #[test]
    fn database_names_are_validated() {
        for ok in ["db", "a/b", "x_1$(+)-"] {
            assert!(is_valid_database_name(ok), "{}", ok);
        }
        for bad in ["", "Db", "1db", "d b", "_db"] {
            assert!(!is_valid_database_name(bad), "{}", bad);
        }
    }

    #[test]
    fn paths_round_trip_through_names() {
        let dir = unique_tmp_dir("paths");
        let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
        let p = m.path_for_database_named("team/db").unwrap();
        assert_eq!(p, dir.join("team:db.docview"));
        assert_eq!(m.name_of_database_at_path(&p).as_deref(), Some("team/db"));
        assert!(m.name_of_database_at_path(Path::new("/x/other.txt")).is_none());
        assert!(matches!(
            m.path_for_database_named("Bad"),
            Err(ViewError::InvalidName(_))
        ));
    }

    #[test]
    fn database_named_returns_live_instance() {
        let m = Manager::in_memory().unwrap();
        assert!(matches!(m.database_named("db", true), Err(ViewError::NotFound(_))));
        let a = m.database_named("db", false).unwrap();
        let b = m.database_named("db", true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.all_open_databases().len(), 1);

        assert!(matches!(m.forget(&a), Err(ViewError::Conflict(_))));
        a.close();
        m.forget(&a).unwrap();
        assert!(m.all_open_databases().is_empty());
        let c = m.database_named("db", false).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn file_databases_persist_across_managers() {
        let dir = unique_tmp_dir("persist");
        {
            let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
            let db = m.database_named("db", false).unwrap();
            db.put_document("a", json!({"n": 1})).unwrap();
            m.close_database("db").unwrap();
            assert!(matches!(m.close_database("db"), Err(ViewError::NotFound(_))));
        }
        let m = Manager::new(ManagerOptions::file_backed(&dir)).unwrap();
        let db = m.database_named("db", true).unwrap();
        assert_eq!(db.last_sequence(), 1);
    }

    #[test]
    fn read_only_manager_never_creates() {
        let dir = unique_tmp_dir("ro");
        let mut opts = ManagerOptions::file_backed(&dir);
        opts.read_only = true;
        let m = Manager::new(opts).unwrap();
        assert!(matches!(m.database_named("db", false), Err(ViewError::NotFound(_))));
    }

    #[test]
    fn closed_manager_rejects_opens() {
        let m = Manager::in_memory().unwrap();
        let db = m.database_named("db", false).unwrap();
        m.close();
        assert!(!db.is_open());
        assert!(m.all_open_databases().is_empty());
        assert!(m.database_named("db", false).is_err());
        m.close();
    }

    #[test]
    fn replicator_validation_checks_local_database() {
        let m = Manager::in_memory().unwrap();
        let push = json!({"source": "db", "target": "http://remote/db"});
        let e = m.validate_replicator_properties(&push).unwrap_err();
        assert!(matches!(e, ViewError::NotFound(_)));

        let pull = json!({"source": "http://remote/db", "target": "db", "create_target": true});
        m.validate_replicator_properties(&pull).unwrap();
        let r = m.replicator_with_properties(&pull).unwrap();
        assert!(r.is_active());
        // create_target 建出了本地库
        m.database_named("db", true).unwrap();
        m.validate_replicator_properties(&push).unwrap();
    }

    #[test]
    fn replicators_are_deduplicated() {
        let m = Manager::in_memory().unwrap();
        m.database_named("db", false).unwrap();
        let a = m
            .replicator_with_properties(&json!({"source": "db", "target": "http://R/db/"}))
            .unwrap();
        let b = m
            .replicator_with_properties(&json!({
                "target": {"url": "http://r:80/db"},
                "source": "db",
                "continuous": false
            }))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.active_replicators().len(), 1);

        let stopped = m
            .replicator_with_properties(&json!({"source": "db", "target": "http://r/db", "cancel": true}))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &stopped));
        assert!(!a.is_active());
        assert!(m.active_replicators().is_empty());

        let fresh = m
            .replicator_with_properties(&json!({"source": "db", "target": "http://r/db"}))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &fresh));
        assert!(matches!(
            m.cancel_replication(&json!({"source": "db", "target": "http://other/db"})),
            Err(ViewError::NotFound(_))
        ));
    }
}
