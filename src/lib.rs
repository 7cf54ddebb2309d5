//! docview：嵌入式文档数据库的增量 map/reduce 视图索引核心。
//!
//! - `index`：View / 更新器 / 存储后端 / map 语言
//! - `query`：查询引擎、QueryRow、QueryEnumerator
//! - `manager`：数据库注册表与复制任务去重

pub mod core;
pub mod event;
pub mod index;
pub mod manager;
pub mod query;
pub mod stats;
pub mod storage;

pub use crate::core::{
    Collation, Document, ManagerOptions, Result, SequenceNumber, Status, StorageType, ViewError,
};
pub use crate::index::{InvalidationPolicy, UpdateControl, View, ViewDefinition};
pub use crate::manager::{Database, Manager, Replicator};
pub use crate::query::{IndexUpdateMode, QueryEnumerator, QueryOptions, QueryRow};
pub use crate::stats::{IndexReport, UpdateStats};
