use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::row::QueryRow;
use crate::core::{Collation, Result, ViewError};
use crate::index::storage::KeyRange;

/// 行过滤器：在 skip / limit 之前逐行求值；返回 Err 视为不匹配
pub type RowFilter = Arc<dyn Fn(&QueryRow) -> Result<bool> + Send + Sync>;

/// `View::run` 的索引更新时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexUpdateMode {
    /// 先更新再查询
    #[default]
    Before,
    /// 不更新，接受陈旧结果
    Never,
    /// 先查询（持有旧快照），再更新
    After,
}

/// 查询参数（不可变值，builder 风格构造）
#[derive(Clone)]
pub struct QueryOptions {
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub start_doc_id: Option<String>,
    pub end_doc_id: Option<String>,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    /// 显式 key 列表；与 start/end key 互斥
    pub keys: Option<Vec<Value>>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub descending: bool,
    pub include_docs: bool,
    /// None：视图有 reduce 时默认 reduce
    pub reduce: Option<bool>,
    pub group: bool,
    pub group_level: usize,
    pub filter: Option<RowFilter>,
    pub index_update_mode: IndexUpdateMode,
    /// 立即物化结果（支持 row_count / row_at / reset）
    pub materialize: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            start_doc_id: None,
            end_doc_id: None,
            inclusive_start: true,
            inclusive_end: true,
            keys: None,
            skip: 0,
            limit: None,
            descending: false,
            include_docs: false,
            reduce: None,
            group: false,
            group_level: 0,
            filter: None,
            index_update_mode: IndexUpdateMode::Before,
            materialize: false,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("start_key", &self.start_key)
            .field("end_key", &self.end_key)
            .field("start_doc_id", &self.start_doc_id)
            .field("end_doc_id", &self.end_doc_id)
            .field("inclusive_start", &self.inclusive_start)
            .field("inclusive_end", &self.inclusive_end)
            .field("keys", &self.keys)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("descending", &self.descending)
            .field("include_docs", &self.include_docs)
            .field("reduce", &self.reduce)
            .field("group", &self.group)
            .field("group_level", &self.group_level)
            .field("filter", &self.filter.is_some())
            .field("index_update_mode", &self.index_update_mode)
            .field("materialize", &self.materialize)
            .finish()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_key(mut self, key: Value) -> Self {
        self.start_key = Some(key);
        self
    }

    pub fn end_key(mut self, key: Value) -> Self {
        self.end_key = Some(key);
        self
    }

    pub fn start_doc_id(mut self, id: impl Into<String>) -> Self {
        self.start_doc_id = Some(id.into());
        self
    }

    pub fn end_doc_id(mut self, id: impl Into<String>) -> Self {
        self.end_doc_id = Some(id.into());
        self
    }

    pub fn inclusive_start(mut self, yes: bool) -> Self {
        self.inclusive_start = yes;
        self
    }

    pub fn inclusive_end(mut self, yes: bool) -> Self {
        self.inclusive_end = yes;
        self
    }

    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn descending(mut self, yes: bool) -> Self {
        self.descending = yes;
        self
    }

    pub fn include_docs(mut self, yes: bool) -> Self {
        self.include_docs = yes;
        self
    }

    pub fn reduce(mut self, yes: bool) -> Self {
        self.reduce = Some(yes);
        self
    }

    pub fn group(mut self, yes: bool) -> Self {
        self.group = yes;
        self
    }

    pub fn group_level(mut self, level: usize) -> Self {
        self.group_level = level;
        self
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryRow) -> Result<bool> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn index_update_mode(mut self, mode: IndexUpdateMode) -> Self {
        self.index_update_mode = mode;
        self
    }

    pub fn materialize(mut self, yes: bool) -> Self {
        self.materialize = yes;
        self
    }

    pub fn wants_reduce(&self, has_reduce: bool) -> bool {
        self.reduce.unwrap_or(has_reduce)
    }

    pub fn is_grouped(&self) -> bool {
        self.group || self.group_level > 0
    }

    /// 互相矛盾的参数 -> BadRequest（在任何读取之前）
    pub fn validate(&self, collation: Collation, has_reduce: bool) -> Result<()> {
        if self.keys.is_some() && (self.start_key.is_some() || self.end_key.is_some()) {
            return Err(ViewError::bad_request("keys cannot be combined with start_key/end_key"));
        }
        if let (Some(s), Some(e)) = (&self.start_key, &self.end_key) {
            let inverted = match collation.compare(s, e) {
                Ordering::Greater => !self.descending,
                Ordering::Less => self.descending,
                Ordering::Equal => false,
            };
            if inverted {
                return Err(ViewError::bad_request(format!(
                    "start_key {} is past end_key {} for {} order",
                    s,
                    e,
                    if self.descending { "descending" } else { "ascending" }
                )));
            }
        }
        if self.reduce == Some(true) && !has_reduce {
            return Err(ViewError::bad_request("view has no reduce function"));
        }
        let reduce = self.wants_reduce(has_reduce);
        if self.is_grouped() && !reduce {
            return Err(ViewError::bad_request("group / group_level require reduce"));
        }
        if reduce && self.include_docs {
            return Err(ViewError::bad_request("include_docs is invalid for reduce"));
        }
        if reduce && self.filter.is_some() {
            return Err(ViewError::bad_request("row filter is invalid for reduce"));
        }
        Ok(())
    }

    pub fn key_range(&self) -> KeyRange {
        KeyRange {
            start_key: self.start_key.clone(),
            start_doc_id: self.start_doc_id.clone(),
            end_key: self.end_key.clone(),
            end_doc_id: self.end_doc_id.clone(),
            inclusive_start: self.inclusive_start,
            inclusive_end: self.inclusive_end,
            descending: self.descending,
        }
    }
}
