use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::index::{SimpleCompiler, ViewCompiler, ViewDefinition};

/// Manager 级共享状态：跨数据库实例可见，由 Manager 注入（无全局变量）。
///
/// - 各语言的 view 编译器
/// - 已绑定的视图定义：视图关闭后重开（或数据库重开）仍能拿回 map/reduce
pub struct Shared {
    compilers: RwLock<HashMap<String, Arc<dyn ViewCompiler>>>,
    /// (database, view) -> definition
    definitions: DashMap<(String, String), ViewDefinition>,
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    /// 预注册 `simple` 编译器
    pub fn new() -> Self {
        let s = Self {
            compilers: RwLock::new(HashMap::new()),
            definitions: DashMap::new(),
        };
        s.register_compiler(Arc::new(SimpleCompiler));
        s
    }

    pub fn register_compiler(&self, compiler: Arc<dyn ViewCompiler>) {
        let language = compiler.language().to_string();
        tracing::debug!("View compiler registered: {}", language);
        self.compilers.write().insert(language, compiler);
    }

    pub fn compiler(&self, language: &str) -> Option<Arc<dyn ViewCompiler>> {
        self.compilers.read().get(language).cloned()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut v: Vec<String> = self.compilers.read().keys().cloned().collect();
        v.sort();
        v
    }

    pub fn set_view_definition(&self, database: &str, view: &str, def: ViewDefinition) {
        self.definitions
            .insert((database.to_string(), view.to_string()), def);
    }

    pub fn view_definition(&self, database: &str, view: &str) -> Option<ViewDefinition> {
        self.definitions
            .get(&(database.to_string(), view.to_string()))
            .map(|d| d.clone())
    }

    pub fn forget_view_definition(&self, database: &str, view: &str) {
        self.definitions
            .remove(&(database.to_string(), view.to_string()));
    }

    /// 数据库被 forget 时清掉它的全部共享条目
    pub fn forget_database(&self, database: &str) {
        self.definitions.retain(|(db, _), _| db != database);
    }
}
