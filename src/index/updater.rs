//! 增量索引更新。
//!
//! 一次更新（pass）：
//! 1) 锁住目标视图所在的组（按组名排序），在锁内读取各视图绑定的 map
//! 2) `since = min(last_sequence_indexed)`
//! 3) 同一把读锁下取得 `current` 与 `(since, current]` 的 changes（每个文档只有最新修订）
//! 4) 逐变更、逐视图：修订未变跳过；否则删除该文档旧行，删除事件到此为止，其余调用 map 插入新行
//! 5) 所有事务推进 last_sequence_indexed 到 current，全部 prepare 成功后依次 commit
//!
//! 任一存储失败或中断：全部回滚，last_sequence_indexed 不变，重试从同一 since 重算。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde_json::Value;

use super::function::{Emitter, MapFunction};
use super::storage::IndexTransaction;
use super::view::View;
use crate::core::adaptive::{ExecutionStrategy, Task};
use crate::core::{is_design_id, Change, Result, SequenceNumber, Status, ViewError};
use crate::event::ViewChange;
use crate::manager::Database;
use crate::stats::UpdateStats;

/// 更新的中断控制：取消标志 + 可选截止时间，在文档之间检查
#[derive(Clone, Debug)]
pub struct UpdateControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for UpdateControl {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateControl {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// 可交给其它线程的取消句柄
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    fn check(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(ViewError::Interrupted);
        }
        Ok(())
    }
}

/// 更新视图，并顺带更新同组其它已绑定 map 的过期视图
pub fn update_index(view: &Arc<View>) -> Result<Status> {
    update_index_with(view, &UpdateControl::new())
}

pub fn update_index_with(view: &Arc<View>, control: &UpdateControl) -> Result<Status> {
    let db = view.database()?;
    // 未绑定时先从设计文档编译；真正使用的 map 在组锁内再读
    view.resolve_map()?;
    let mut targets = vec![(view.clone(), true)];
    for other in view.views_in_group()? {
        if !Arc::ptr_eq(&other, view) {
            targets.push((other, false));
        }
    }
    run_pass(&db, targets, control)
}

/// 只更新这一个视图
pub fn update_index_alone(view: &Arc<View>) -> Result<Status> {
    update_index_alone_with(view, &UpdateControl::new())
}

pub fn update_index_alone_with(view: &Arc<View>, control: &UpdateControl) -> Result<Status> {
    let db = view.database()?;
    view.resolve_map()?;
    run_pass(&db, vec![(view.clone(), true)], control)
}

/// 把给定视图集合作为一批更新（必须属于同一数据库）
pub fn update_indexes(views: &[Arc<View>]) -> Result<Status> {
    update_indexes_with(views, &UpdateControl::new())
}

pub fn update_indexes_with(views: &[Arc<View>], control: &UpdateControl) -> Result<Status> {
    let Some(first) = views.first() else {
        return Ok(Status::NotModified);
    };
    let db = first.database()?;
    let mut targets: Vec<(Arc<View>, bool)> = Vec::with_capacity(views.len());
    for v in views {
        if !Arc::ptr_eq(&v.database()?, &db) {
            return Err(ViewError::bad_request(format!(
                "view {:?} belongs to a different database",
                v.name()
            )));
        }
        if targets.iter().any(|(t, _)| Arc::ptr_eq(t, v)) {
            continue;
        }
        v.resolve_map()?;
        targets.push((v.clone(), true));
    }
    run_pass(&db, targets, control)
}

struct Target {
    view: Arc<View>,
    txn: Box<dyn IndexTransaction>,
    last: SequenceNumber,
    changed: bool,
}

enum Action {
    Skip,
    Delete,
    /// 下标指向本批 map 结果
    Map(usize),
}

fn run_map(map: &dyn MapFunction, change: &Change) -> Result<Vec<(Value, Value)>> {
    let Some(doc) = &change.document else {
        return Ok(Vec::new());
    };
    let input = doc.to_map_input();
    let mut emitter = Emitter::new();
    map.map(&input, &mut emitter)?;
    Ok(emitter.into_rows())
}

fn rollback_all(work: Vec<Target>) {
    for t in work {
        t.txn.rollback();
    }
}

/// `targets` 中标记为必需的视图在锁内没有 map 时报 NotFound，其余没有 map 的跳过
fn run_pass(
    db: &Arc<Database>,
    targets: Vec<(Arc<View>, bool)>,
    control: &UpdateControl,
) -> Result<Status> {
    let started = Instant::now();
    let _groups = db
        .group_locks()
        .lock_views(targets.iter().map(|(v, _)| v.name()));

    // map 与索引在同一把组锁下读取：换 map 的 set_definition 也持这把锁
    let mut candidates = Vec::with_capacity(targets.len());
    for (view, required) in targets {
        let Some(map) = view.registered_map() else {
            if required {
                return Err(ViewError::NotFound(format!(
                    "view {:?} has no map function",
                    view.name()
                )));
            }
            continue;
        };
        let storage = view.storage()?;
        let last = storage.last_sequence_indexed();
        candidates.push((view, storage, map, last));
    }

    let Some(since) = candidates.iter().map(|c| c.3).min() else {
        db.record_not_modified();
        return Ok(Status::NotModified);
    };
    let (current, changes) = db.changes_to_current(since);

    let mut work: Vec<Target> = Vec::new();
    let mut maps: Vec<Arc<dyn MapFunction>> = Vec::new();
    for (view, storage, map, last) in candidates {
        if last >= current {
            continue;
        }
        let txn = match storage.begin_transaction() {
            Ok(t) => t,
            Err(e) => {
                rollback_all(work);
                return Err(e);
            }
        };
        work.push(Target {
            view,
            txn,
            last,
            changed: false,
        });
        maps.push(map);
    }

    if work.is_empty() {
        db.record_not_modified();
        return Ok(Status::NotModified);
    }

    let strategy = db.scheduler().select_strategy(&Task::IndexUpdate {
        changes: changes.len(),
        views: work.len(),
    });

    let mut stats = UpdateStats {
        views_updated: work.len(),
        changes_scanned: changes.len(),
        parallel: matches!(strategy, ExecutionStrategy::Parallel { .. }),
        ..UpdateStats::default()
    };

    if let Err(e) = apply_changes(&mut work, &maps, &changes, strategy, db, control, &mut stats) {
        rollback_all(work);
        db.record_failure();
        tracing::debug!("Index update rolled back (since={} current={}): {}", since, current, e);
        return Err(e);
    }

    for t in work.iter_mut() {
        t.txn.set_last_sequence_indexed(current);
        if t.changed {
            t.txn.set_last_sequence_changed_at(current);
        }
    }

    // 先全部 prepare，再全部 commit
    if let Err(e) = work.iter_mut().try_for_each(|t| t.txn.prepare()) {
        rollback_all(work);
        db.record_failure();
        return Err(e);
    }
    let mut committed = Vec::with_capacity(work.len());
    let mut pending = work.into_iter();
    while let Some(t) = pending.next() {
        if let Err(e) = t.txn.commit() {
            rollback_all(pending.collect());
            db.record_failure();
            tracing::warn!("Index commit failed for {}: {}", t.view.name(), e);
            return Err(e);
        }
        committed.push(t.view);
    }

    for view in &committed {
        let changed_at = view.last_sequence_changed_at().unwrap_or(current);
        view.notify(ViewChange {
            view: view.name().to_string(),
            last_sequence_indexed: current,
            last_sequence_changed_at: changed_at,
        });
    }

    stats.elapsed = started.elapsed();
    tracing::debug!(
        "Index updated: views={} changes={} mapped={} skipped={} deleted={} rows +{}/-{} errors={} seq {}->{} in {:?}",
        stats.views_updated,
        stats.changes_scanned,
        stats.documents_mapped,
        stats.documents_skipped,
        stats.deletions,
        stats.rows_added,
        stats.rows_removed,
        stats.map_errors,
        since,
        current,
        stats.elapsed
    );
    db.record_pass(&stats);
    Ok(Status::Ok)
}

fn apply_changes(
    work: &mut [Target],
    maps: &[Arc<dyn MapFunction>],
    changes: &[Change],
    strategy: ExecutionStrategy,
    db: &Database,
    control: &UpdateControl,
    stats: &mut UpdateStats,
) -> Result<()> {
    let batch = match strategy {
        ExecutionStrategy::Serial => db.indexer_options().batch_size,
        ExecutionStrategy::Parallel { batch } => batch,
    }
    .max(1);

    for chunk in changes.chunks(batch) {
        control.check()?;

        // 计划：(change, view, action)
        let mut actions: Vec<(usize, usize, Action)> = Vec::new();
        let mut jobs: Vec<(usize, usize)> = Vec::new();
        for (ci, change) in chunk.iter().enumerate() {
            if is_design_id(&change.doc_id) {
                continue;
            }
            for (vi, t) in work.iter().enumerate() {
                if change.sequence <= t.last {
                    continue;
                }
                let action = if t.txn.document_revision(&change.doc_id).as_deref()
                    == Some(change.rev.as_str())
                {
                    Action::Skip
                } else if change.is_deletion() {
                    Action::Delete
                } else {
                    jobs.push((ci, vi));
                    Action::Map(jobs.len() - 1)
                };
                actions.push((ci, vi, action));
            }
        }

        let mut results: Vec<Option<Result<Vec<(Value, Value)>>>> = match strategy {
            ExecutionStrategy::Parallel { .. } => jobs
                .par_iter()
                .map(|&(ci, vi)| Some(run_map(maps[vi].as_ref(), &chunk[ci])))
                .collect(),
            ExecutionStrategy::Serial => jobs
                .iter()
                .map(|&(ci, vi)| Some(run_map(maps[vi].as_ref(), &chunk[ci])))
                .collect(),
        };

        let mut last_ci = usize::MAX;
        for (ci, vi, action) in actions {
            if ci != last_ci {
                control.check()?;
                last_ci = ci;
            }
            let change = &chunk[ci];
            let t = &mut work[vi];
            match action {
                Action::Skip => stats.documents_skipped += 1,
                Action::Delete => {
                    let removed = t.txn.remove_document(&change.doc_id);
                    stats.deletions += 1;
                    stats.rows_removed += removed;
                    t.changed |= removed > 0;
                }
                Action::Map(j) => {
                    let outcome = results[j].take().unwrap_or_else(|| Ok(Vec::new()));
                    let removed = t.txn.remove_document(&change.doc_id);
                    stats.rows_removed += removed;
                    let emitted = match outcome {
                        Ok(rows) => {
                            stats.documents_mapped += 1;
                            rows
                        }
                        Err(e) => {
                            stats.map_errors += 1;
                            tracing::warn!(
                                "Map function failed on {} (view {}): {}",
                                change.doc_id,
                                t.view.name(),
                                e
                            );
                            Vec::new()
                        }
                    };
                    let added =
                        t.txn
                            .add_document(&change.doc_id, &change.rev, change.sequence, emitted);
                    stats.rows_added += added;
                    t.changed |= removed > 0 || added > 0;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_reports_cancellation_and_deadline() {
        let c = UpdateControl::new();
        assert!(!c.is_interrupted());
        c.cancel_flag().store(true, Ordering::Release);
        assert!(matches!(c.check(), Err(ViewError::Interrupted)));

        let d = UpdateControl::with_timeout(Duration::from_millis(0));
        assert!(d.is_interrupted());
        assert_eq!(ViewError::Interrupted.status(), Status::Unavailable);
    }
}
