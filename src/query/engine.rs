//! 查询引擎：在一个索引快照上执行 QueryOptions。
//!
//! 顺序：范围 / keys → 行过滤 → skip → limit → include_docs。
//! reduce 时：范围内的行按分组 key 连续聚合，skip / limit 作用于分组结果。

use std::sync::{Arc, Weak};

use serde_json::Value;

use super::enumerator::{QueryEnumerator, RowStream};
use super::options::QueryOptions;
use super::row::{QueryRow, RowLink};
use crate::core::{Collation, Result, ViewError};
use crate::index::function::ReduceFunction;
use crate::index::storage::{IndexRow, IndexSnapshot, RowIter};
use crate::manager::Database;

fn index_rows(snapshot: Arc<dyn IndexSnapshot>, options: &QueryOptions) -> RowIter {
    match &options.keys {
        Some(keys) => {
            let descending = options.descending;
            let keys = keys.clone();
            Box::new(keys.into_iter().flat_map(move |k| {
                let mut rows = snapshot.get(&k);
                if descending {
                    rows.reverse();
                }
                rows.into_iter()
            }))
        }
        None => snapshot.scan(options.key_range()),
    }
}

/// group_level 截断：数组 key 取前 n 个元素，其它 key 原样
pub fn group_key(key: &Value, options: &QueryOptions) -> Value {
    if options.group_level > 0 {
        if let Value::Array(items) = key {
            return Value::Array(items.iter().take(options.group_level).cloned().collect());
        }
        return key.clone();
    }
    if options.group {
        return key.clone();
    }
    Value::Null
}

fn reduce_groups(
    rows: RowIter,
    reducer: &dyn ReduceFunction,
    collation: Collation,
    options: &QueryOptions,
    link: &Arc<RowLink>,
) -> Result<Vec<QueryRow>> {
    let mut out = Vec::new();
    let mut current: Option<Value> = None;
    let mut keys: Vec<Value> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut max_seq = 0;

    let mut flush = |gk: Value, keys: &mut Vec<Value>, values: &mut Vec<Value>, seq: u64| -> Result<()> {
        let reduced = reducer.reduce(keys, values, false).map_err(|e| match e {
            ViewError::Callback(_) => e,
            other => ViewError::Callback(other.to_string()),
        })?;
        out.push(QueryRow::new(gk, reduced, None, seq, Some(link.clone())));
        keys.clear();
        values.clear();
        Ok(())
    };

    for IndexRow {
        key,
        value,
        sequence,
        ..
    } in rows
    {
        let gk = group_key(&key, options);
        match &current {
            Some(c) if collation.keys_equal(c, &gk) => {}
            Some(_) => {
                if let Some(done) = current.take() {
                    flush(done, &mut keys, &mut values, max_seq)?;
                }
                max_seq = 0;
                current = Some(gk);
            }
            None => current = Some(gk),
        }
        keys.push(key);
        values.push(value);
        max_seq = max_seq.max(sequence);
    }
    if let Some(done) = current.take() {
        flush(done, &mut keys, &mut values, max_seq)?;
    }
    Ok(out)
}

/// 执行查询；调用方保证快照与 reduce 函数来自同一视图
pub(crate) fn execute(
    database: &Arc<Database>,
    snapshot: Arc<dyn IndexSnapshot>,
    reduce: Option<Arc<dyn ReduceFunction>>,
    options: &QueryOptions,
    link: Arc<RowLink>,
) -> Result<QueryEnumerator> {
    let collation = snapshot.collation();
    options.validate(collation, reduce.is_some())?;
    let sequence = snapshot.last_sequence_indexed();
    let weak_db: Weak<Database> = Arc::downgrade(database);

    if let (true, Some(reducer)) = (options.wants_reduce(reduce.is_some()), reduce) {
        let rows = index_rows(snapshot, options);
        let groups = reduce_groups(rows, reducer.as_ref(), collation, options, &link)?;
        let limited: Vec<QueryRow> = groups
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        return Ok(QueryEnumerator::materialized(sequence, weak_db, limited));
    }

    let row_link = link.clone();
    let mut stream: RowStream = Box::new(index_rows(snapshot, options).map(move |r| {
        QueryRow::new(r.key, r.value, Some(r.doc_id), r.sequence, Some(row_link.clone()))
    }));

    if let Some(filter) = options.filter.clone() {
        stream = Box::new(stream.filter(move |row| match filter(row) {
            Ok(keep) => keep,
            Err(e) => {
                tracing::debug!("Row filter failed for {:?}: {}", row.doc_id(), e);
                false
            }
        }));
    }

    let mut stream: RowStream = Box::new(
        stream
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX)),
    );

    if options.include_docs {
        let db = weak_db.clone();
        stream = Box::new(stream.map(move |mut row| {
            let doc = match (db.upgrade(), row.doc_id()) {
                (Some(db), Some(id)) => db.document(id).map(|d| d.to_map_input()),
                _ => None,
            };
            row.set_document(doc);
            row
        }));
    }

    let e = QueryEnumerator::lazy(sequence, weak_db, stream);
    Ok(if options.materialize { e.materialize() } else { e })
}
