use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 按订阅加锁：同一个 key 的读-判断-写串行执行，不同 key 互不阻塞
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        // 只有表自己持有的条目说明没有人在使用，顺手清理
        self.inner.retain(|_, m| Arc::strong_count(m) > 1);
        let slot = Arc::clone(&self.inner.entry(key).or_default());
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.inner.len()
    }
}
