use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;

use crate::core::{Change, Document, Result, Revision, SequenceNumber, ViewError};
use crate::storage::wal::{LogRecord, WalStore};

/// 索引器消费的文档来源（changes feed）
pub trait ChangeSource: Send + Sync {
    fn current_sequence(&self) -> SequenceNumber;

    /// `(since, upto]` 区间内每个文档的最新修订，按序列号升序
    fn changes_since(&self, since: SequenceNumber, upto: SequenceNumber) -> Vec<Change>;

    /// 同一时刻读取当前序列号与 `(since, current]` 的 changes
    fn changes_to_current(&self, since: SequenceNumber) -> (SequenceNumber, Vec<Change>);

    fn document(&self, id: &str) -> Option<Document>;
}

#[derive(Default)]
struct StoreState {
    docs: HashMap<String, Document>,
    /// by-sequence 索引：每个文档只保留最新序列号
    by_seq: BTreeMap<SequenceNumber, String>,
    last_sequence: SequenceNumber,
}

impl StoreState {
    fn apply(&mut self, doc: Document) {
        if let Some(old) = self.docs.get(&doc.id) {
            self.by_seq.remove(&old.sequence);
        }
        self.by_seq.insert(doc.sequence, doc.id.clone());
        self.last_sequence = self.last_sequence.max(doc.sequence);
        self.docs.insert(doc.id.clone(), doc);
    }

    fn changes(&self, since: SequenceNumber, upto: SequenceNumber) -> Vec<Change> {
        if upto <= since {
            return Vec::new();
        }
        self.by_seq
            .range(since + 1..=upto)
            .filter_map(|(_, id)| self.docs.get(id))
            .map(|d| Change {
                sequence: d.sequence,
                doc_id: d.id.clone(),
                rev: d.rev.clone(),
                deleted: d.deleted,
                document: (!d.deleted).then(|| d.clone()),
            })
            .collect()
    }
}

/// 文档存储替身：内存状态 + 可选的 WAL 持久化。
///
/// 写入在 `state` 写锁内完成“落 WAL → 分配序列号 → 更新内存”，
/// 因此 changes 读取（读锁）永远看不到半完成的写入。
pub struct DocumentStore {
    state: RwLock<StoreState>,
    wal: Option<WalStore>,
    read_only: bool,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            wal: None,
            read_only: false,
        }
    }

    /// 打开（或创建）WAL 并回放；只读时只读取日志，不持有可写句柄
    pub fn open_persistent(path: PathBuf, read_only: bool) -> Result<Self> {
        let (wal, replay) = if read_only {
            (None, WalStore::read_only_replay(&path)?)
        } else {
            let wal = WalStore::open(path)?;
            let replay = wal.replay()?;
            (Some(wal), replay)
        };
        let mut st = StoreState::default();
        for rec in replay.records {
            let rev = Revision::parse(&rec.rev).ok_or_else(|| {
                ViewError::storage(format!("bad revision {:?} in document log", rec.rev))
            })?;
            st.apply(Document {
                id: rec.doc_id,
                rev,
                sequence: rec.sequence,
                deleted: rec.deleted,
                body: rec.body,
            });
        }
        tracing::debug!(
            "Document log replayed: {} docs, last_sequence={}",
            st.docs.len(),
            st.last_sequence
        );
        Ok(Self {
            state: RwLock::new(st),
            wal,
            read_only,
        })
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.state.read().last_sequence
    }

    pub fn document_count(&self) -> usize {
        self.state.read().docs.values().filter(|d| !d.deleted).count()
    }

    pub fn put(&self, id: &str, body: Value) -> Result<Document> {
        self.write(id, Some(body))
    }

    pub fn delete(&self, id: &str) -> Result<Document> {
        self.write(id, None)
    }

    fn write(&self, id: &str, body: Option<Value>) -> Result<Document> {
        if self.read_only {
            return Err(ViewError::Forbidden("database is read-only".into()));
        }
        if id.is_empty() {
            return Err(ViewError::bad_request("document id must not be empty"));
        }

        let mut st = self.state.write();
        let prev = st.docs.get(id);
        let generation = prev.map(|d| d.rev.generation()).unwrap_or(0) + 1;
        let deleted = body.is_none();
        if deleted && prev.map_or(true, |d| d.deleted) {
            return Err(ViewError::NotFound(format!("document {:?}", id)));
        }
        let body = body.unwrap_or(Value::Null);
        let sequence = st.last_sequence + 1;
        let doc = Document {
            id: id.to_string(),
            rev: Revision::new(generation, &body),
            sequence,
            deleted,
            body,
        };

        if let Some(wal) = &self.wal {
            wal.append(&[LogRecord {
                sequence,
                doc_id: doc.id.clone(),
                rev: doc.rev.to_string(),
                deleted,
                body: doc.body.clone(),
            }])?;
        }
        st.apply(doc.clone());
        Ok(doc)
    }

    /// 只保留每个文档的最新修订重写 WAL
    pub fn compact_log(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let st = self.state.read();
        let records: Vec<LogRecord> = st
            .by_seq
            .values()
            .filter_map(|id| st.docs.get(id))
            .map(|d| LogRecord {
                sequence: d.sequence,
                doc_id: d.id.clone(),
                rev: d.rev.to_string(),
                deleted: d.deleted,
                body: d.body.clone(),
            })
            .collect();
        wal.compact(&records)
    }
}

impl ChangeSource for DocumentStore {
    fn current_sequence(&self) -> SequenceNumber {
        self.last_sequence()
    }

    fn changes_since(&self, since: SequenceNumber, upto: SequenceNumber) -> Vec<Change> {
        self.state.read().changes(since, upto)
    }

    fn changes_to_current(&self, since: SequenceNumber) -> (SequenceNumber, Vec<Change>) {
        let st = self.state.read();
        (st.last_sequence, st.changes(since, st.last_sequence))
    }

    fn document(&self, id: &str) -> Option<Document> {
        self.state
            .read()
            .docs
            .get(id)
            .filter(|d| !d.deleted)
            .cloned()
    }
}
