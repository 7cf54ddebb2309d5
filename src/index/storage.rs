//! 视图索引存储能力（Storage Capability）。
//!
//! 契约：
//! - 行按 `(collation(key), doc_id, emit_index)` 全序；实现必须按其被告知的 collation 保序。
//! - `snapshot()` 返回不可变快照：之后的提交对已取得的快照不可见。
//! - 一次 `IndexTransaction` 内的行写入与 `last_sequence_indexed` 推进同时可见或同时不可见。
//! - `prepare()` 做所有可能失败的工作；`prepare` 成功后的 `commit` 只做发布。

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use serde_json::Value;

use crate::core::{Collation, Result, Revision, SequenceNumber};

/// 带 collation 的 key：BTreeMap 排序依据
#[derive(Clone, Debug)]
pub struct CollatedKey {
    pub value: Value,
    pub collation: Collation,
}

impl CollatedKey {
    pub fn new(value: Value, collation: Collation) -> Self {
        Self { value, collation }
    }
}

impl PartialEq for CollatedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CollatedKey {}

impl PartialOrd for CollatedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollatedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.collation.compare(&self.value, &other.value)
    }
}

/// 同 key 内的文档位置；`First` / `Last` 只用作区间边界
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DocPos {
    First,
    Id(String),
    Last,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowKey {
    pub key: CollatedKey,
    pub doc: DocPos,
    pub emit_index: u32,
}

impl RowKey {
    pub fn row(key: Value, collation: Collation, doc_id: &str, emit_index: u32) -> Self {
        Self {
            key: CollatedKey::new(key, collation),
            doc: DocPos::Id(doc_id.to_string()),
            emit_index,
        }
    }

    pub fn bound(key: Value, collation: Collation, doc: DocPos, emit_index: u32) -> Self {
        Self {
            key: CollatedKey::new(key, collation),
            doc,
            emit_index,
        }
    }
}

/// 存储层返回的一行
#[derive(Clone, Debug, PartialEq)]
pub struct IndexRow {
    pub key: Value,
    pub value: Value,
    pub doc_id: String,
    pub emit_index: u32,
    /// 产生该行的文档修订所在序列号
    pub sequence: SequenceNumber,
}

/// 扫描区间；`start` / `end` 按迭代方向理解（descending 时 start 是高端）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyRange {
    pub start_key: Option<Value>,
    pub start_doc_id: Option<String>,
    pub end_key: Option<Value>,
    pub end_doc_id: Option<String>,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    pub descending: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            inclusive_start: true,
            inclusive_end: true,
            ..Self::default()
        }
    }

    pub fn exact(key: Value) -> Self {
        Self {
            start_key: Some(key.clone()),
            end_key: Some(key),
            ..Self::all()
        }
    }

    /// 转成 BTreeMap 的 (下界, 上界)
    pub fn to_bounds(&self, collation: Collation) -> (Bound<RowKey>, Bound<RowKey>) {
        let doc = |id: &Option<String>, default: DocPos| {
            id.as_ref().map(|s| DocPos::Id(s.clone())).unwrap_or(default)
        };
        let low_incl = |k: &Value, d: DocPos| Bound::Included(RowKey::bound(k.clone(), collation, d, 0));
        let high_incl =
            |k: &Value, d: DocPos| Bound::Included(RowKey::bound(k.clone(), collation, d, u32::MAX));
        let below = |k: &Value| Bound::Excluded(RowKey::bound(k.clone(), collation, DocPos::First, 0));
        let above = |k: &Value| Bound::Excluded(RowKey::bound(k.clone(), collation, DocPos::Last, 0));

        if !self.descending {
            let lo = match &self.start_key {
                None => Bound::Unbounded,
                Some(k) if self.inclusive_start => low_incl(k, doc(&self.start_doc_id, DocPos::First)),
                Some(k) => above(k),
            };
            let hi = match &self.end_key {
                None => Bound::Unbounded,
                Some(k) if self.inclusive_end => high_incl(k, doc(&self.end_doc_id, DocPos::Last)),
                Some(k) => below(k),
            };
            (lo, hi)
        } else {
            let hi = match &self.start_key {
                None => Bound::Unbounded,
                Some(k) if self.inclusive_start => high_incl(k, doc(&self.start_doc_id, DocPos::Last)),
                Some(k) => below(k),
            };
            let lo = match &self.end_key {
                None => Bound::Unbounded,
                Some(k) if self.inclusive_end => low_incl(k, doc(&self.end_doc_id, DocPos::First)),
                Some(k) => above(k),
            };
            (lo, hi)
        }
    }
}

/// `BTreeMap::range` 对 start > end 会 panic；先判空
pub fn bounds_empty(lo: &Bound<RowKey>, hi: &Bound<RowKey>) -> bool {
    let (l, l_incl) = match lo {
        Bound::Unbounded => return false,
        Bound::Included(k) => (k, true),
        Bound::Excluded(k) => (k, false),
    };
    let (h, h_incl) = match hi {
        Bound::Unbounded => return false,
        Bound::Included(k) => (k, true),
        Bound::Excluded(k) => (k, false),
    };
    match l.cmp(h) {
        Ordering::Greater => true,
        Ordering::Equal => !(l_incl && h_incl),
        Ordering::Less => false,
    }
}

pub type RowIter = Box<dyn Iterator<Item = IndexRow> + Send>;

/// 某一提交点上的只读索引快照
pub trait IndexSnapshot: Send + Sync {
    fn last_sequence_indexed(&self) -> SequenceNumber;
    fn last_sequence_changed_at(&self) -> SequenceNumber;
    fn total_rows(&self) -> usize;
    fn collation(&self) -> Collation;
    fn map_version(&self) -> Option<String>;
    fn document_revision(&self, doc_id: &str) -> Option<String>;

    /// 与 key 相等（按 collation）的所有行
    fn get(&self, key: &Value) -> Vec<IndexRow>;

    /// 惰性有序扫描；迭代器持有快照本身，不借用调用方
    fn scan(self: Arc<Self>, range: KeyRange) -> RowIter;
}

/// 一次索引写事务
pub trait IndexTransaction: Send {
    /// 事务开始时的 last_sequence_indexed
    fn base_sequence(&self) -> SequenceNumber;

    fn document_revision(&self, doc_id: &str) -> Option<String>;

    /// 删除该文档的全部行并忘记其修订；返回删除行数
    fn remove_document(&mut self, doc_id: &str) -> usize;

    /// 记录文档修订并插入其 emit 的行（emit_index 按顺序编号）；返回插入行数
    fn add_document(
        &mut self,
        doc_id: &str,
        rev: &Revision,
        sequence: SequenceNumber,
        emissions: Vec<(Value, Value)>,
    ) -> usize;

    fn set_last_sequence_indexed(&mut self, seq: SequenceNumber);
    fn set_last_sequence_changed_at(&mut self, seq: SequenceNumber);

    fn set_map_version(&mut self, version: Option<String>);

    /// 改变 collation 会清空全部行（旧顺序失效）
    fn set_collation(&mut self, collation: Collation);

    /// 清空行与修订，序列号归零
    fn reset_index(&mut self);

    fn prepare(&mut self) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>);
}

/// 每个视图独占一个存储实例
pub trait ViewStorage: Send + Sync {
    fn name(&self) -> &str;

    fn snapshot(&self) -> Arc<dyn IndexSnapshot>;

    fn begin_transaction(&self) -> Result<Box<dyn IndexTransaction>>;

    /// 释放资源；已取得的快照仍然可读，之后的事务失败
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn last_sequence_indexed(&self) -> SequenceNumber {
        self.snapshot().last_sequence_indexed()
    }

    fn last_sequence_changed_at(&self) -> SequenceNumber {
        self.snapshot().last_sequence_changed_at()
    }

    fn total_rows(&self) -> usize {
        self.snapshot().total_rows()
    }

    fn collation(&self) -> Collation {
        self.snapshot().collation()
    }

    fn map_version(&self) -> Option<String> {
        self.snapshot().map_version()
    }

    fn set_map_version(&self, version: Option<String>) -> Result<()> {
        let mut txn = self.begin_transaction()?;
        txn.set_map_version(version);
        commit_single(txn)
    }

    fn set_collation(&self, collation: Collation) -> Result<()> {
        let mut txn = self.begin_transaction()?;
        txn.set_collation(collation);
        commit_single(txn)
    }

    fn delete_index(&self) -> Result<()> {
        let mut txn = self.begin_transaction()?;
        txn.reset_index();
        commit_single(txn)
    }
}

fn commit_single(mut txn: Box<dyn IndexTransaction>) -> Result<()> {
    match txn.prepare() {
        Ok(()) => txn.commit(),
        Err(e) => {
            txn.rollback();
            Err(e)
        }
    }
}
