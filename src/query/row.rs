use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::core::SequenceNumber;
use crate::manager::Database;

struct RowBinding {
    database: Arc<Database>,
    view: String,
}

/// 行到 (数据库, 视图) 的回指。
///
/// 同一次查询的所有行共享一个 link；视图或数据库关闭时显式清空，
/// 之后行退化为纯值。
pub struct RowLink {
    binding: RwLock<Option<RowBinding>>,
}

impl RowLink {
    pub fn new(database: Arc<Database>, view: &str) -> Arc<Self> {
        Arc::new(Self {
            binding: RwLock::new(Some(RowBinding {
                database,
                view: view.to_string(),
            })),
        })
    }

    pub fn detach(&self) {
        self.binding.write().take();
    }

    pub fn is_detached(&self) -> bool {
        self.binding.read().is_none()
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.binding.read().as_ref().map(|b| b.database.clone())
    }

    pub fn view_name(&self) -> Option<String> {
        self.binding.read().as_ref().map(|b| b.view.clone())
    }
}

/// 一行查询结果
#[derive(Clone)]
pub struct QueryRow {
    key: Value,
    value: Value,
    doc_id: Option<String>,
    sequence: SequenceNumber,
    document: Option<Value>,
    link: Option<Arc<RowLink>>,
}

impl QueryRow {
    pub fn new(
        key: Value,
        value: Value,
        doc_id: Option<String>,
        sequence: SequenceNumber,
        link: Option<Arc<RowLink>>,
    ) -> Self {
        Self {
            key,
            value,
            doc_id,
            sequence,
            document: None,
            link,
        }
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// reduce 行没有 doc id
    pub fn doc_id(&self) -> Option<&str> {
        self.doc_id.as_deref()
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// 预取的文档（include_docs）
    pub fn prefetched_document(&self) -> Option<&Value> {
        self.document.as_ref()
    }

    pub(crate) fn set_document(&mut self, doc: Option<Value>) {
        self.document = doc;
    }

    /// 预取文档优先；否则经 link 到数据库读取当前修订。已脱离时返回 None
    pub fn document(&self) -> Option<Value> {
        if let Some(d) = &self.document {
            return Some(d.clone());
        }
        let id = self.doc_id.as_deref()?;
        let db = self.link.as_ref()?.database()?;
        db.document(id).map(|d| d.to_map_input())
    }

    pub fn is_detached(&self) -> bool {
        self.link.as_ref().map_or(true, |l| l.is_detached())
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.link.as_ref()?.database()
    }

    pub fn view_name(&self) -> Option<String> {
        self.link.as_ref()?.view_name()
    }

    /// 去掉回指，得到纯值
    pub fn detached(mut self) -> Self {
        self.link = None;
        self
    }
}

impl PartialEq for QueryRow {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.doc_id == other.doc_id
            && self.sequence == other.sequence
    }
}

impl std::fmt::Debug for QueryRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRow")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("doc_id", &self.doc_id)
            .field("sequence", &self.sequence)
            .field("detached", &self.is_detached())
            .finish()
    }
}
