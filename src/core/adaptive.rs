use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::config::IndexerOptions;

/// 自适应调度器：按一次索引更新的工作量选择串行 / 并行执行 map
pub struct AdaptiveScheduler {
    target_parallelism: AtomicUsize,
    parallel_threshold: usize,
    batch_size: usize,
}

impl AdaptiveScheduler {
    pub fn new(options: &IndexerOptions) -> Self {
        Self {
            target_parallelism: AtomicUsize::new(num_cpus::get().max(1)),
            parallel_threshold: options.parallel_threshold,
            batch_size: options.batch_size.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.target_parallelism.load(Ordering::Relaxed)
    }

    /// 测试 / 嵌入方可限制并行度（例如移动端只给 2 核）
    pub fn set_parallelism(&self, n: usize) -> usize {
        let n = n.max(1);
        let old = self.target_parallelism.swap(n, Ordering::Relaxed);
        if old != n {
            tracing::info!("Index update parallelism: {} -> {}", old, n);
        }
        n
    }

    /// 根据任务特性选择执行策略
    pub fn select_strategy(&self, task: &Task) -> ExecutionStrategy {
        let parallelism = self.parallelism();
        match task {
            Task::IndexUpdate { changes, views } => {
                let work = changes.saturating_mul((*views).max(1));
                if parallelism <= 1 || work < self.parallel_threshold {
                    // 小范围更新：串行避免调度开销
                    ExecutionStrategy::Serial
                } else {
                    ExecutionStrategy::Parallel {
                        batch: self.batch_size,
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    IndexUpdate { changes: usize, views: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Serial,
    Parallel { batch: usize },
}
