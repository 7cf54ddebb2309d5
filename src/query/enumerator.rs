use std::sync::Weak;

use super::row::QueryRow;
use crate::core::SequenceNumber;
use crate::manager::Database;

pub type RowStream = Box<dyn Iterator<Item = QueryRow> + Send>;

enum Source {
    /// 一次性游标（快照之上）
    Lazy(RowStream),
    Materialized { rows: Vec<QueryRow>, pos: usize },
}

/// 查询结果序列，绑定到执行查询时视图的 last_sequence_indexed
pub struct QueryEnumerator {
    sequence_number: SequenceNumber,
    database: Weak<Database>,
    source: Source,
}

impl QueryEnumerator {
    pub fn lazy(sequence_number: SequenceNumber, database: Weak<Database>, rows: RowStream) -> Self {
        Self {
            sequence_number,
            database,
            source: Source::Lazy(rows),
        }
    }

    pub fn materialized(
        sequence_number: SequenceNumber,
        database: Weak<Database>,
        rows: Vec<QueryRow>,
    ) -> Self {
        Self {
            sequence_number,
            database,
            source: Source::Materialized { rows, pos: 0 },
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// 数据库序列号已超过查询时的索引序列号
    pub fn is_stale(&self) -> bool {
        match self.database.upgrade() {
            Some(db) => db.last_sequence() > self.sequence_number,
            None => false,
        }
    }

    /// 收集剩余行；已物化的保持原状
    pub fn materialize(mut self) -> Self {
        if let Source::Lazy(it) = &mut self.source {
            let rows: Vec<QueryRow> = it.collect();
            self.source = Source::Materialized { rows, pos: 0 };
        }
        self
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.source, Source::Materialized { .. })
    }

    /// 仅物化后可用
    pub fn row_count(&self) -> Option<usize> {
        match &self.source {
            Source::Materialized { rows, .. } => Some(rows.len()),
            Source::Lazy(_) => None,
        }
    }

    pub fn row_at(&self, index: usize) -> Option<&QueryRow> {
        match &self.source {
            Source::Materialized { rows, .. } => rows.get(index),
            Source::Lazy(_) => None,
        }
    }

    /// 回到开头；懒序列不可重放，返回 false
    pub fn reset(&mut self) -> bool {
        match &mut self.source {
            Source::Materialized { pos, .. } => {
                *pos = 0;
                true
            }
            Source::Lazy(_) => false,
        }
    }

    pub fn next_row(&mut self) -> Option<QueryRow> {
        match &mut self.source {
            Source::Lazy(it) => it.next(),
            Source::Materialized { rows, pos } => {
                let r = rows.get(*pos).cloned();
                if r.is_some() {
                    *pos += 1;
                }
                r
            }
        }
    }

    /// 剩余行
    pub fn into_rows(self) -> Vec<QueryRow> {
        match self.source {
            Source::Lazy(it) => it.collect(),
            Source::Materialized { rows, pos } => rows.into_iter().skip(pos).collect(),
        }
    }
}

impl Iterator for QueryEnumerator {
    type Item = QueryRow;

    fn next(&mut self) -> Option<QueryRow> {
        self.next_row()
    }
}

impl std::fmt::Debug for QueryEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEnumerator")
            .field("sequence_number", &self.sequence_number)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
