use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::memory::{IndexCore, IndexState, MemoryTransaction};
use super::storage::{IndexSnapshot, IndexTransaction, ViewStorage};
use crate::core::{Collation, Result, Revision, SequenceNumber};
use crate::storage::{PreparedSnapshot, SnapshotStore};

/// 文件后端：内存发布点 + 每次提交一份原子快照文件。
///
/// 提交顺序：prepare 写 tmp 并 fsync → commit 时 rename → 再切换内存快照。
/// 崩溃后重开得到的是最后一次成功 rename 的状态。
pub struct FileViewStorage {
    core: Arc<IndexCore>,
    store: Arc<SnapshotStore>,
}

impl FileViewStorage {
    pub fn open(name: &str, path: PathBuf, collation: Collation) -> Result<Self> {
        let store = SnapshotStore::new(path);
        let state = match store.load_if_valid() {
            Ok(Some(p)) => match IndexState::from_persisted(p) {
                Ok(st) => st,
                Err(e) => {
                    tracing::warn!("Index snapshot unreadable ({}), starting empty: {}", name, e);
                    IndexState::empty(collation)
                }
            },
            Ok(None) => IndexState::empty(collation),
            Err(e) => {
                tracing::warn!("Index snapshot corrupt ({}), starting empty: {}", name, e);
                IndexState::empty(collation)
            }
        };
        tracing::debug!(
            "Index opened: {} rows={} last_seq={} path={}",
            name,
            state.total_rows(),
            state.last_sequence_indexed(),
            store.path().display()
        );
        Ok(Self {
            core: IndexCore::new(name, state),
            store: Arc::new(store),
        })
    }

    pub fn exists_at(path: &Path) -> bool {
        path.exists()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// 删除快照文件（delete_index 之后仍保留空快照；这里是彻底移除）
    pub fn remove_file(&self) -> Result<()> {
        self.store.remove()
    }
}

impl ViewStorage for FileViewStorage {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn snapshot(&self) -> Arc<dyn IndexSnapshot> {
        self.core.load()
    }

    fn begin_transaction(&self) -> Result<Box<dyn IndexTransaction>> {
        Ok(Box::new(FileTransaction {
            inner: MemoryTransaction::begin(self.core.clone())?,
            store: self.store.clone(),
            prepared: None,
        }))
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

struct FileTransaction {
    inner: MemoryTransaction,
    store: Arc<SnapshotStore>,
    prepared: Option<PreparedSnapshot>,
}

impl IndexTransaction for FileTransaction {
    fn base_sequence(&self) -> SequenceNumber {
        self.inner.base_sequence()
    }

    fn document_revision(&self, doc_id: &str) -> Option<String> {
        self.inner.document_revision(doc_id)
    }

    fn remove_document(&mut self, doc_id: &str) -> usize {
        self.inner.remove_document(doc_id)
    }

    fn add_document(
        &mut self,
        doc_id: &str,
        rev: &Revision,
        sequence: SequenceNumber,
        emissions: Vec<(Value, Value)>,
    ) -> usize {
        self.inner.add_document(doc_id, rev, sequence, emissions)
    }

    fn set_last_sequence_indexed(&mut self, seq: SequenceNumber) {
        self.inner.set_last_sequence_indexed(seq);
    }

    fn set_last_sequence_changed_at(&mut self, seq: SequenceNumber) {
        self.inner.set_last_sequence_changed_at(seq);
    }

    fn set_map_version(&mut self, version: Option<String>) {
        self.inner.set_map_version(version);
    }

    fn set_collation(&mut self, collation: Collation) {
        self.inner.set_collation(collation);
    }

    fn reset_index(&mut self) {
        self.inner.reset_index();
    }

    fn prepare(&mut self) -> Result<()> {
        self.inner.prepare()?;
        if let Some(old) = self.prepared.take() {
            old.discard();
        }
        let persisted = self.inner.working().to_persisted()?;
        self.prepared = Some(self.store.prepare(&persisted)?);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.prepared.is_none() {
            self.prepare()?;
        }
        let this = *self;
        let Some(prepared) = this.prepared else {
            return Box::new(this.inner).commit();
        };
        if !this.inner.is_current() {
            prepared.discard();
            // 交给内层报告冲突
            return Box::new(this.inner).commit();
        }
        prepared.publish()?;
        Box::new(this.inner).commit()
    }

    fn rollback(self: Box<Self>) {
        let this = *self;
        if let Some(p) = this.prepared {
            p.discard();
        }
        Box::new(this.inner).rollback();
    }
}
