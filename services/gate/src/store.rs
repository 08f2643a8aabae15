//! 带过期清扫的内存存储：四类限时记录（使用台账、换绑码、会话、临时链接）共用。

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::RwLock;

/// 当前 unix 秒。
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 可被清扫器判定过期的记录。
pub(crate) trait Expiring {
    /// `now` 时刻该记录是否已可清除。
    fn purge_eligible(&self, now: u64) -> bool;
}

/// 进程内限时存储。所有读改写都在同一把写锁内完成。
pub(crate) struct ExpiringStore<K, V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for ExpiringStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash,
    V: Expiring,
{
    /// 创建空存储，`name` 仅用于日志与调试快照。
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 存储名。
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// 只读访问单条记录。
    pub(crate) async fn read<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        let guard = self.entries.read().await;
        f(guard.get(key))
    }

    /// 在写锁内对整张表执行一次原子读改写。
    pub(crate) async fn update<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut guard = self.entries.write().await;
        f(&mut guard)
    }

    /// 插入或覆盖记录。
    pub(crate) async fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.write().await.insert(key, value)
    }

    /// 当前记录数。
    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 清除 `now` 时刻已过期的记录，返回清除数量。
    pub(crate) async fn sweep(&self, now: u64) -> usize {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, value| !value.purge_eligible(now));
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Expiring, ExpiringStore};

    struct Entry {
        expires_at: u64,
    }

    impl Expiring for Entry {
        fn purge_eligible(&self, now: u64) -> bool {
            now > self.expires_at
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sweep_removes_only_expired_entries() {
        let store = ExpiringStore::new("demo");
        store.insert("a", Entry { expires_at: 10 }).await;
        store.insert("b", Entry { expires_at: 20 }).await;
        store.insert("c", Entry { expires_at: 30 }).await;

        assert_eq!(store.sweep(20).await, 1);
        assert_eq!(store.len().await, 2);
        assert!(store.read(&"a", |entry| entry.is_none()).await);
        assert!(store.read(&"b", |entry| entry.is_some()).await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clones_share_the_same_table() {
        let store: ExpiringStore<&str, Entry> = ExpiringStore::new("shared");
        let other = store.clone();
        other.insert("k", Entry { expires_at: 1 }).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.name(), "shared");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_runs_read_modify_write_atomically() {
        let store = ExpiringStore::new("counter");
        store.insert("k", Entry { expires_at: 0 }).await;

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(|map| {
                        if let Some(entry) = map.get_mut("k") {
                            entry.expires_at += 1;
                        }
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.expect("join update task");
        }

        let value = store.read(&"k", |entry| entry.map(|e| e.expires_at)).await;
        assert_eq!(value, Some(32));
    }
}
