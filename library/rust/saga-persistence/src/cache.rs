use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

/// セカンダリインデックス解決キャッシュの既定容量。
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// BoundedLookupCache は容量固定・LRU 退避のスレッドセーフなキャッシュ。
///
/// 全操作を単一のロックで排他するが、ロック中に行うのは O(1) の処理のみで I/O は行わない。
/// キャッシュはあくまで高速化のためのもので、保持している値が最新である保証はない。
pub struct BoundedLookupCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> BoundedLookupCache<K, V> {
    /// 指定容量のキャッシュを作成する。容量 0 は 1 に切り上げる。
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// ヒットした場合はエントリを最近使用済みに昇格して値を返す。
    pub fn try_get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// 挿入または上書きする。容量超過時は最も長く使われていないエントリを1件退避する。
    pub fn put(&self, key: K, value: V) {
        self.lock().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    // ロック保持中にパニックしても LRU の構造は壊れないため、毒化は無視して続行する
    fn lock(&self) -> MutexGuard<'_, LruCache<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Hash + Eq, V: Clone> Default for BoundedLookupCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
