//! ViewGroup：同一设计文档前缀（`prefix/`）下的视图一起索引。
//!
//! 组是计算出来的，不持久化；这里只负责组名与组锁。

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RawMutex};

/// `app/by_type` -> `app`；无 `/` 的视图自成一组
pub fn group_name(view_name: &str) -> &str {
    match view_name.split_once('/') {
        Some((prefix, _)) => prefix,
        None => view_name,
    }
}

pub fn same_group(a: &str, b: &str) -> bool {
    if !a.contains('/') || !b.contains('/') {
        return a == b;
    }
    group_name(a) == group_name(b)
}

/// 每组一把互斥锁；多组时按组名排序加锁，避免死锁
#[derive(Default)]
pub struct GroupLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// 持有若干组锁，drop 时按逆序释放
pub struct GroupGuard {
    groups: Vec<String>,
    guards: Vec<parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>>,
}

impl GroupGuard {
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        while let Some(g) = self.guards.pop() {
            drop(g);
        }
    }
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, group: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 锁住给定视图所在的全部组
    pub fn lock_views<'a>(&self, view_names: impl IntoIterator<Item = &'a str>) -> GroupGuard {
        let groups: BTreeSet<String> = view_names
            .into_iter()
            .map(|v| group_name(v).to_string())
            .collect();
        let mut guards = Vec::with_capacity(groups.len());
        for g in &groups {
            guards.push(self.lock_for(g).lock_arc());
        }
        GroupGuard {
            groups: groups.into_iter().collect(),
            guards,
        }
    }

    pub fn is_locked(&self, group: &str) -> bool {
        self.locks.get(group).map_or(false, |m| m.is_locked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_is_design_prefix() {
        assert_eq!(group_name("app/by_type"), "app");
        assert_eq!(group_name("app/nested/x"), "app");
        assert_eq!(group_name("solo"), "solo");
        assert!(same_group("app/a", "app/b"));
        assert!(!same_group("app/a", "other/a"));
        assert!(!same_group("app", "app/a"));
    }

    #[test]
    fn locks_are_taken_once_per_group_in_order() {
        let locks = GroupLocks::new();
        let g = locks.lock_views(["b/x", "a/y", "b/z"]);
        assert_eq!(g.groups(), &["a".to_string(), "b".to_string()]);
        assert!(locks.is_locked("a"));
        assert!(locks.is_locked("b"));
        drop(g);
        assert!(!locks.is_locked("a"));
    }

    #[test]
    fn different_groups_do_not_block_each_other() {
        let locks = Arc::new(GroupLocks::new());
        let _a = locks.lock_views(["a/v"]);
        let l2 = locks.clone();
        let handle = std::thread::spawn(move || {
            let _b = l2.lock_views(["b/v"]);
            true
        });
        assert!(handle.join().unwrap());
    }
}
