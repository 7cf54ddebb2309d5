use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;

use super::storage::{
    bounds_empty, DocPos, IndexRow, IndexSnapshot, IndexTransaction, KeyRange, RowIter, RowKey,
    ViewStorage,
};
use crate::core::{Collation, Result, Revision, SequenceNumber, ViewError};
use crate::storage::{PersistedIndex, PersistedRow};

#[derive(Clone, Debug, PartialEq)]
struct RowData {
    value: Value,
    sequence: SequenceNumber,
}

#[derive(Clone, Debug)]
struct DocEntry {
    rev: String,
    keys: Vec<RowKey>,
}

/// 已折叠的行表；多个提交点共享同一个 `Arc`
#[derive(Clone, Debug, Default)]
struct RowTable {
    rows: BTreeMap<RowKey, RowData>,
    /// doc_id -> (已索引修订, 该文档产生的全部行 key)
    by_doc: HashMap<String, DocEntry>,
}

/// 叠在 `RowTable` 之上的增量；`None` 是删除标记
#[derive(Clone, Debug, Default)]
struct RowDelta {
    rows: BTreeMap<RowKey, Option<RowData>>,
    by_doc: HashMap<String, Option<DocEntry>>,
}

impl RowDelta {
    fn len(&self) -> usize {
        self.rows.len() + self.by_doc.len()
    }
}

/// 增量不超过该值（或底表的 1/4）时不折叠
const FOLD_MIN: usize = 4096;

/// 一个提交点上的索引状态（不可变发布）。
///
/// 行存放在共享底表 + 有界增量里：开事务只复制增量，
/// 增量变大时在提交前折叠成新的底表。
#[derive(Clone, Debug)]
pub struct IndexState {
    collation: Collation,
    map_version: Option<String>,
    last_sequence_indexed: SequenceNumber,
    last_sequence_changed_at: SequenceNumber,
    total_rows: usize,
    base: Arc<RowTable>,
    delta: RowDelta,
}

impl IndexState {
    pub fn empty(collation: Collation) -> Self {
        Self {
            collation,
            map_version: None,
            last_sequence_indexed: 0,
            last_sequence_changed_at: 0,
            total_rows: 0,
            base: Arc::new(RowTable::default()),
            delta: RowDelta::default(),
        }
    }

    fn doc_entry(&self, doc_id: &str) -> Option<&DocEntry> {
        match self.delta.by_doc.get(doc_id) {
            Some(e) => e.as_ref(),
            None => self.base.by_doc.get(doc_id),
        }
    }

    fn has_row(&self, key: &RowKey) -> bool {
        match self.delta.rows.get(key) {
            Some(r) => r.is_some(),
            None => self.base.rows.contains_key(key),
        }
    }

    fn remove_document(&mut self, doc_id: &str) -> usize {
        let Some(entry) = self.doc_entry(doc_id).cloned() else {
            return 0;
        };
        let mut removed = 0;
        for k in entry.keys {
            if !self.has_row(&k) {
                continue;
            }
            removed += 1;
            if self.base.rows.contains_key(&k) {
                self.delta.rows.insert(k, None);
            } else {
                self.delta.rows.remove(&k);
            }
        }
        if self.base.by_doc.contains_key(doc_id) {
            self.delta.by_doc.insert(doc_id.to_string(), None);
        } else {
            self.delta.by_doc.remove(doc_id);
        }
        self.total_rows -= removed;
        removed
    }

    fn add_document(
        &mut self,
        doc_id: &str,
        rev: &Revision,
        sequence: SequenceNumber,
        emissions: Vec<(Value, Value)>,
    ) -> usize {
        self.remove_document(doc_id);
        let mut keys = Vec::with_capacity(emissions.len());
        for (i, (key, value)) in emissions.into_iter().enumerate() {
            let rk = RowKey::row(key, self.collation, doc_id, i as u32);
            self.delta.rows.insert(rk.clone(), Some(RowData { value, sequence }));
            keys.push(rk);
        }
        let added = keys.len();
        self.total_rows += added;
        self.delta.by_doc.insert(
            doc_id.to_string(),
            Some(DocEntry {
                rev: rev.to_string(),
                keys,
            }),
        );
        added
    }

    fn reset(&mut self) {
        self.base = Arc::new(RowTable::default());
        self.delta = RowDelta::default();
        self.total_rows = 0;
        self.last_sequence_indexed = 0;
        self.last_sequence_changed_at = 0;
    }

    /// 增量超过阈值时并入一张新底表；旧底表仍被旧快照持有
    fn fold_delta(&mut self) {
        if self.delta.len() > (self.base.rows.len() / 4).max(FOLD_MIN) {
            self.fold_into_base();
        }
    }

    fn fold_into_base(&mut self) {
        let mut table = (*self.base).clone();
        for (k, r) in std::mem::take(&mut self.delta.rows) {
            match r {
                Some(data) => {
                    table.rows.insert(k, data);
                }
                None => {
                    table.rows.remove(&k);
                }
            }
        }
        for (id, e) in std::mem::take(&mut self.delta.by_doc) {
            match e {
                Some(entry) => {
                    table.by_doc.insert(id, entry);
                }
                None => {
                    table.by_doc.remove(&id);
                }
            }
        }
        self.base = Arc::new(table);
    }

    /// 区间内下一条可见行（增量覆盖底表，跳过删除标记），并收紧边界
    fn next_visible(
        &self,
        lo: &mut Bound<RowKey>,
        hi: &mut Bound<RowKey>,
        descending: bool,
    ) -> Option<(RowKey, RowData)> {
        loop {
            if bounds_empty(lo, hi) {
                return None;
            }
            let from_delta = {
                let mut r = self.delta.rows.range((lo.clone(), hi.clone()));
                if descending { r.next_back() } else { r.next() }
            };
            let from_base = {
                let mut r = self.base.rows.range((lo.clone(), hi.clone()));
                if descending { r.next_back() } else { r.next() }
            };
            let (key, data) = match (from_delta, from_base) {
                (None, None) => return None,
                (Some((k, d)), None) => (k, d.as_ref()),
                (None, Some((k, d))) => (k, Some(d)),
                (Some((dk, dd)), Some((bk, bd))) => {
                    let delta_first = if descending { dk >= bk } else { dk <= bk };
                    if delta_first {
                        (dk, dd.as_ref())
                    } else {
                        (bk, Some(bd))
                    }
                }
            };
            let key = key.clone();
            let data = data.cloned();
            if descending {
                *hi = Bound::Excluded(key.clone());
            } else {
                *lo = Bound::Excluded(key.clone());
            }
            if let Some(d) = data {
                return Some((key, d));
            }
        }
    }

    pub fn to_persisted(&self) -> Result<PersistedIndex> {
        let mut rows = Vec::with_capacity(self.total_rows);
        let (mut lo, mut hi) = (Bound::Unbounded, Bound::Unbounded);
        while let Some((k, v)) = self.next_visible(&mut lo, &mut hi, false) {
            let DocPos::Id(doc_id) = &k.doc else {
                continue;
            };
            rows.push(PersistedRow {
                key_json: serde_json::to_string(&k.key.value)?,
                value_json: serde_json::to_string(&v.value)?,
                doc_id: doc_id.clone(),
                emit_index: k.emit_index,
                sequence: v.sequence,
            });
        }
        let mut doc_revs: Vec<(String, String)> = self
            .base
            .by_doc
            .iter()
            .filter(|(id, _)| !self.delta.by_doc.contains_key(*id))
            .chain(
                self.delta
                    .by_doc
                    .iter()
                    .filter_map(|(id, e)| e.as_ref().map(|e| (id, e))),
            )
            .map(|(id, e)| (id.clone(), e.rev.clone()))
            .collect();
        doc_revs.sort();
        Ok(PersistedIndex {
            map_version: self.map_version.clone(),
            collation: self.collation,
            last_sequence_indexed: self.last_sequence_indexed,
            last_sequence_changed_at: self.last_sequence_changed_at,
            rows,
            doc_revs,
        })
    }

    pub fn from_persisted(p: PersistedIndex) -> Result<Self> {
        let mut table = RowTable::default();
        for (id, rev) in p.doc_revs {
            table.by_doc.insert(id, DocEntry { rev, keys: Vec::new() });
        }
        for r in p.rows {
            let key: Value = serde_json::from_str(&r.key_json)?;
            let value: Value = serde_json::from_str(&r.value_json)?;
            let rk = RowKey::row(key, p.collation, &r.doc_id, r.emit_index);
            let entry = table.by_doc.get_mut(&r.doc_id).ok_or_else(|| {
                ViewError::storage(format!("index row for unknown document {:?}", r.doc_id))
            })?;
            entry.keys.push(rk.clone());
            table.rows.insert(
                rk,
                RowData {
                    value,
                    sequence: r.sequence,
                },
            );
        }
        Ok(Self {
            collation: p.collation,
            map_version: p.map_version,
            last_sequence_indexed: p.last_sequence_indexed,
            last_sequence_changed_at: p.last_sequence_changed_at,
            total_rows: table.rows.len(),
            base: Arc::new(table),
            delta: RowDelta::default(),
        })
    }
}

fn to_row(k: &RowKey, v: &RowData) -> IndexRow {
    let doc_id = match &k.doc {
        DocPos::Id(id) => id.clone(),
        DocPos::First | DocPos::Last => String::new(),
    };
    IndexRow {
        key: k.key.value.clone(),
        value: v.value.clone(),
        doc_id,
        emit_index: k.emit_index,
        sequence: v.sequence,
    }
}

impl IndexSnapshot for IndexState {
    fn last_sequence_indexed(&self) -> SequenceNumber {
        self.last_sequence_indexed
    }

    fn last_sequence_changed_at(&self) -> SequenceNumber {
        self.last_sequence_changed_at
    }

    fn total_rows(&self) -> usize {
        self.total_rows
    }

    fn collation(&self) -> Collation {
        self.collation
    }

    fn map_version(&self) -> Option<String> {
        self.map_version.clone()
    }

    fn document_revision(&self, doc_id: &str) -> Option<String> {
        self.doc_entry(doc_id).map(|e| e.rev.clone())
    }

    fn get(&self, key: &Value) -> Vec<IndexRow> {
        let (mut lo, mut hi) = KeyRange::exact(key.clone()).to_bounds(self.collation);
        let mut out = Vec::new();
        while let Some((k, v)) = self.next_visible(&mut lo, &mut hi, false) {
            out.push(to_row(&k, &v));
        }
        out
    }

    fn scan(self: Arc<Self>, range: KeyRange) -> RowIter {
        let (lo, hi) = range.to_bounds(self.collation);
        Box::new(ScanIter {
            state: self,
            lo,
            hi,
            descending: range.descending,
            done: false,
        })
    }
}

/// 游标：持有快照 Arc 与移动中的边界，每步一次 O(log n) 定位
struct ScanIter {
    state: Arc<IndexState>,
    lo: Bound<RowKey>,
    hi: Bound<RowKey>,
    descending: bool,
    done: bool,
}

impl Iterator for ScanIter {
    type Item = IndexRow;

    fn next(&mut self) -> Option<IndexRow> {
        if self.done {
            return None;
        }
        match self.state.next_visible(&mut self.lo, &mut self.hi, self.descending) {
            Some((k, v)) => Some(to_row(&k, &v)),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// 内存后端与文件后端共享的发布点
pub(crate) struct IndexCore {
    name: String,
    state: ArcSwap<IndexState>,
    closed: AtomicBool,
}

impl IndexCore {
    pub(crate) fn new(name: &str, state: IndexState) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: ArcSwap::from_pointee(state),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn load(&self) -> Arc<IndexState> {
        self.state.load_full()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ViewError::storage(format!("index {:?} is closed", self.name)));
        }
        Ok(())
    }
}

/// 写时复制事务：begin 时复制基准状态的增量（底表共享），commit 时 CAS 发布。
///
/// 基准在提交前被其它写者替换视为失败（同组锁下不应发生）。
pub struct MemoryTransaction {
    core: Arc<IndexCore>,
    base: Arc<IndexState>,
    working: IndexState,
    prepared: bool,
}

impl MemoryTransaction {
    pub(crate) fn begin(core: Arc<IndexCore>) -> Result<Self> {
        core.ensure_open()?;
        let base = core.load();
        let working = (*base).clone();
        Ok(Self {
            core,
            base,
            working,
            prepared: false,
        })
    }

    pub(crate) fn working(&self) -> &IndexState {
        &self.working
    }

    pub(crate) fn is_current(&self) -> bool {
        Arc::ptr_eq(&self.core.load(), &self.base)
    }

    fn check(&self) -> Result<()> {
        self.core.ensure_open()?;
        if !self.is_current() {
            return Err(ViewError::storage(format!(
                "index {:?} changed during transaction",
                self.core.name()
            )));
        }
        Ok(())
    }
}

impl IndexTransaction for MemoryTransaction {
    fn base_sequence(&self) -> SequenceNumber {
        self.base.last_sequence_indexed
    }

    fn document_revision(&self, doc_id: &str) -> Option<String> {
        self.working.doc_entry(doc_id).map(|e| e.rev.clone())
    }

    fn remove_document(&mut self, doc_id: &str) -> usize {
        self.working.remove_document(doc_id)
    }

    fn add_document(
        &mut self,
        doc_id: &str,
        rev: &Revision,
        sequence: SequenceNumber,
        emissions: Vec<(Value, Value)>,
    ) -> usize {
        self.working.add_document(doc_id, rev, sequence, emissions)
    }

    fn set_last_sequence_indexed(&mut self, seq: SequenceNumber) {
        self.working.last_sequence_indexed = seq;
    }

    fn set_last_sequence_changed_at(&mut self, seq: SequenceNumber) {
        self.working.last_sequence_changed_at = seq;
    }

    fn set_map_version(&mut self, version: Option<String>) {
        self.working.map_version = version;
    }

    fn set_collation(&mut self, collation: Collation) {
        if self.working.collation != collation {
            self.working.reset();
            self.working.collation = collation;
        }
    }

    fn reset_index(&mut self) {
        self.working.reset();
    }

    fn prepare(&mut self) -> Result<()> {
        self.check()?;
        self.prepared = true;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if !self.prepared {
            self.prepare()?;
        }
        let mut this = *self;
        this.working.fold_delta();
        let next = Arc::new(this.working);
        let prev = this.core.state.compare_and_swap(&this.base, next);
        if !Arc::ptr_eq(&prev, &this.base) {
            return Err(ViewError::storage(format!(
                "index {:?} changed during commit",
                this.core.name()
            )));
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        tracing::debug!("Index transaction rolled back: {}", self.core.name());
    }
}

/// 纯内存后端：ArcSwap 发布不可变快照
pub struct MemoryViewStorage {
    core: Arc<IndexCore>,
}

impl MemoryViewStorage {
    pub fn new(name: &str, collation: Collation) -> Self {
        Self {
            core: IndexCore::new(name, IndexState::empty(collation)),
        }
    }
}

impl ViewStorage for MemoryViewStorage {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn snapshot(&self) -> Arc<dyn IndexSnapshot> {
        self.core.load()
    }

    fn begin_transaction(&self) -> Result<Box<dyn IndexTransaction>> {
        Ok(Box::new(MemoryTransaction::begin(self.core.clone())?))
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit(mut t: Box<dyn IndexTransaction>) {
        t.prepare().unwrap();
        t.commit().unwrap();
    }

    fn rev(n: u64) -> Revision {
        Revision::new(n, &json!({ "n": n }))
    }

    fn keys(rows: impl Iterator<Item = IndexRow>) -> Vec<(Value, String)> {
        rows.map(|r| (r.key, r.doc_id)).collect()
    }

    fn seeded() -> MemoryViewStorage {
        let s = MemoryViewStorage::new("app/by_type", Collation::Unicode);
        let mut t = s.begin_transaction().unwrap();
        t.add_document("a", &rev(1), 1, vec![(json!("x"), json!(1))]);
        t.add_document("b", &rev(1), 2, vec![(json!("x"), json!(2)), (json!("y"), json!(3))]);
        t.add_document("c", &rev(1), 3, vec![(json!("w"), json!(4))]);
        t.set_last_sequence_indexed(3);
        t.set_last_sequence_changed_at(3);
        commit(t);
        s
    }

    #[test]
    fn scan_orders_by_key_then_doc_id() {
        let s = seeded();
        let got = keys(s.snapshot().scan(KeyRange::all()));
        assert_eq!(
            got,
            vec![
                (json!("w"), "c".to_string()),
                (json!("x"), "a".to_string()),
                (json!("x"), "b".to_string()),
                (json!("y"), "b".to_string()),
            ]
        );
        assert_eq!(s.total_rows(), 4);
        assert_eq!(s.last_sequence_indexed(), 3);
    }

    #[test]
    fn descending_and_exclusive_ranges() {
        let s = seeded();
        let r = KeyRange {
            start_key: Some(json!("x")),
            descending: true,
            ..KeyRange::all()
        };
        let got = keys(s.snapshot().scan(r));
        assert_eq!(got[0], (json!("x"), "b".to_string()));
        assert_eq!(got.len(), 3);

        let r = KeyRange {
            start_key: Some(json!("w")),
            end_key: Some(json!("y")),
            inclusive_start: false,
            inclusive_end: false,
            descending: false,
            ..KeyRange::default()
        };
        assert_eq!(keys(s.snapshot().scan(r)).len(), 2);

        let r = KeyRange {
            start_key: Some(json!("x")),
            start_doc_id: Some("b".into()),
            ..KeyRange::all()
        };
        assert_eq!(keys(s.snapshot().scan(r)).len(), 2);
    }

    #[test]
    fn snapshot_is_isolated_from_later_commits() {
        let s = seeded();
        let before = s.snapshot();
        let mut iter = before.clone().scan(KeyRange::all());
        let first = iter.next().unwrap();

        let mut t = s.begin_transaction().unwrap();
        assert_eq!(t.remove_document("b"), 2);
        t.set_last_sequence_indexed(4);
        commit(t);

        assert_eq!(first.doc_id, "c");
        assert_eq!(iter.count(), 3);
        assert_eq!(before.total_rows(), 4);
        assert_eq!(s.total_rows(), 2);
        assert_eq!(s.snapshot().document_revision("b"), None);
    }

    #[test]
    fn rollback_leaves_index_untouched() {
        let s = seeded();
        let mut t = s.begin_transaction().unwrap();
        t.reset_index();
        t.rollback();
        assert_eq!(s.total_rows(), 4);
        assert_eq!(s.last_sequence_indexed(), 3);
    }

    #[test]
    fn get_returns_every_row_for_key() {
        let s = seeded();
        let rows = s.snapshot().get(&json!("x"));
        assert_eq!(rows.len(), 2);
        assert!(s.snapshot().get(&json!("nope")).is_empty());
    }

    #[test]
    fn collation_change_clears_rows() {
        let s = seeded();
        s.set_collation(Collation::Raw).unwrap();
        assert_eq!(s.total_rows(), 0);
        assert_eq!(s.last_sequence_indexed(), 0);
        assert_eq!(s.collation(), Collation::Raw);
    }

    #[test]
    fn stale_transaction_fails_to_commit() {
        let s = seeded();
        let t1 = s.begin_transaction().unwrap();
        s.set_map_version(Some("v2".into())).unwrap();
        assert!(t1.commit().is_err());
        assert_eq!(s.map_version().as_deref(), Some("v2"));
    }

    #[test]
    fn closed_storage_refuses_transactions() {
        let s = seeded();
        let snap = s.snapshot();
        s.close();
        assert!(s.begin_transaction().is_err());
        assert_eq!(snap.total_rows(), 4);
    }

    #[test]
    fn transactions_share_committed_rows() {
        let s = seeded();
        // 把种子行折叠进底表
        let mut t = MemoryTransaction::begin(s.core.clone()).unwrap();
        t.working.fold_into_base();
        Box::new(t).commit().unwrap();

        let committed = s.core.load();
        assert!(committed.delta.rows.is_empty());
        let t = MemoryTransaction::begin(s.core.clone()).unwrap();
        assert!(Arc::ptr_eq(&t.working().base, &committed.base));
    }

    #[test]
    fn delta_shadows_base_rows_in_scans() {
        let s = seeded();
        let mut t = MemoryTransaction::begin(s.core.clone()).unwrap();
        t.working.fold_into_base();
        Box::new(t).commit().unwrap();

        let mut t = s.begin_transaction().unwrap();
        assert_eq!(t.remove_document("b"), 2);
        t.add_document("a", &rev(2), 4, vec![(json!("z"), json!(9))]);
        t.add_document("d", &rev(1), 5, vec![(json!("x"), json!(5))]);
        commit(t);

        let snap = s.snapshot();
        assert_eq!(snap.total_rows(), 3);
        assert_eq!(
            keys(snap.clone().scan(KeyRange::all())),
            vec![
                (json!("w"), "c".to_string()),
                (json!("x"), "d".to_string()),
                (json!("z"), "a".to_string()),
            ]
        );
        let desc = KeyRange {
            descending: true,
            ..KeyRange::all()
        };
        assert_eq!(keys(snap.clone().scan(desc))[0], (json!("z"), "a".to_string()));
        assert_eq!(snap.get(&json!("x")).len(), 1);
        assert_eq!(snap.document_revision("b"), None);
        assert_eq!(snap.document_revision("a"), Some(rev(2).to_string()));
    }

    #[test]
    fn large_deltas_fold_into_a_new_base() {
        let s = MemoryViewStorage::new("app/many", Collation::Raw);
        let before = s.core.load();
        let mut t = s.begin_transaction().unwrap();
        for i in 0..(FOLD_MIN as u64) {
            t.add_document(&format!("d{:05}", i), &rev(1), i + 1, vec![(json!(i), json!(null))]);
        }
        t.set_last_sequence_indexed(FOLD_MIN as u64);
        commit(t);

        let after = s.core.load();
        assert!(after.delta.rows.is_empty());
        assert!(!Arc::ptr_eq(&before.base, &after.base));
        assert_eq!(after.total_rows(), FOLD_MIN);
        assert_eq!(after.to_persisted().unwrap().rows.len(), FOLD_MIN);
        // 旧快照不受折叠影响
        assert_eq!(before.total_rows(), 0);
    }

    #[test]
    fn persisted_form_restores_rows_and_revisions() {
        let s = seeded();
        let p = s.core.load().to_persisted().unwrap();
        let back = IndexState::from_persisted(p).unwrap();
        assert_eq!(back.total_rows(), 4);
        assert_eq!(back.document_revision("a"), Some(rev(1).to_string()));
        let back = Arc::new(back);
        assert_eq!(keys(back.scan(KeyRange::all())).len(), 4);
    }
}
