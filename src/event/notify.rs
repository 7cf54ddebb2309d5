use tokio::sync::broadcast;

use crate::core::SequenceNumber;

const CHANNEL_CAPACITY: usize = 64;

/// 视图索引提交后的变更通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewChange {
    pub view: String,
    pub last_sequence_indexed: SequenceNumber,
    pub last_sequence_changed_at: SequenceNumber,
}

/// 单视图的通知通道；订阅方落后超过容量时丢弃旧事件（`RecvError::Lagged`）
pub struct ViewNotifier {
    tx: broadcast::Sender<ViewChange>,
}

impl ViewNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewChange> {
        self.tx.subscribe()
    }

    /// 无订阅者时 send 返回 Err，属正常情况
    pub fn publish(&self, change: ViewChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ViewNotifier {
    fn default() -> Self {
        Self::new()
    }
}
