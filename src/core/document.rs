use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 数据库级单调序列号：每次提交的文档变更 +1
pub type SequenceNumber = u64;

/// 设计文档前缀：不参与 map
pub const DESIGN_DOC_PREFIX: &str = "_design/";

/// 文档修订号 `<generation>-<body 摘要>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    pub fn new(generation: u64, body: &Value) -> Self {
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        let digest = xxhash_rust::xxh3::xxh3_64(&bytes);
        Self(format!("{}-{:016x}", generation, digest))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (gen, digest) = s.split_once('-')?;
        if gen.parse::<u64>().ok()? == 0 || digest.is_empty() {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 文档当前修订（含删除墓碑）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub rev: Revision,
    pub sequence: SequenceNumber,
    pub deleted: bool,
    pub body: Value,
}

impl Document {
    pub fn is_design(&self) -> bool {
        is_design_id(&self.id)
    }

    /// map 函数看到的 JSON：body 之上补 `_id` / `_rev`
    pub fn to_map_input(&self) -> Value {
        let mut v = match &self.body {
            Value::Object(m) => Value::Object(m.clone()),
            other => serde_json::json!({ "value": other.clone() }),
        };
        if let Value::Object(m) = &mut v {
            m.insert("_id".into(), Value::String(self.id.clone()));
            m.insert("_rev".into(), Value::String(self.rev.to_string()));
        }
        v
    }

    /// body 中的顶层字段
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }
}

pub fn is_design_id(id: &str) -> bool {
    id.starts_with(DESIGN_DOC_PREFIX)
}

/// changes feed 中的一条记录：文档在该序列号上的最新修订
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub sequence: SequenceNumber,
    pub doc_id: String,
    pub rev: Revision,
    pub deleted: bool,
    pub document: Option<Document>,
}

impl Change {
    pub fn is_deletion(&self) -> bool {
        self.deleted
    }
}
