//! Single-flight memoizing store for compiled primitives and converted constants.

use std::any::{Any, TypeId};
use std::collections::hash_map::{DefaultHasher, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use once_cell::sync::OnceCell;

use super::error::{ExecResult, ExecutorError};

type ErasedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    key: Box<dyn Any + Send + Sync>,
    cell: Arc<OnceCell<ErasedValue>>,
}

/// Hit and miss totals since the cache was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-local fingerprint of `value`, used for cache buckets and log lines.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Keys of different types never collide: buckets are partitioned by key and value type.
/// Entries are never evicted.
#[derive(Default)]
pub struct PrimitiveCache {
    buckets: Mutex<HashMap<u64, Vec<Entry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PrimitiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_id<K: Hash + 'static, V: 'static>(key: &K) -> u64 {
        hash_value(&(TypeId::of::<K>(), TypeId::of::<V>(), key))
    }

    fn cell_for<K, V>(&self, key: K) -> ExecResult<Arc<OnceCell<ErasedValue>>>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: 'static,
    {
        let bucket_id = Self::bucket_id::<K, V>(&key);
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| ExecutorError::execution("primitive cache poisoned"))?;
        let bucket = buckets.entry(bucket_id).or_default();
        if let Some(entry) = bucket
            .iter()
            .find(|entry| entry.key.downcast_ref::<K>() == Some(&key))
        {
            return Ok(entry.cell.clone());
        }
        let cell = Arc::new(OnceCell::new());
        bucket.push(Entry {
            key: Box::new(key),
            cell: cell.clone(),
        });
        Ok(cell)
    }

    /// Returns the value cached under `key`, building it with `build` when absent.
    ///
    /// Concurrent callers with equal keys observe exactly one `build` invocation; the others
    /// block until it finishes. A failing `build` is reported to its caller and leaves the
    /// entry empty. The flag is `true` for the caller whose `build` produced the value.
    pub fn get_or_create<K, V, F>(&self, key: K, build: F) -> ExecResult<(Arc<V>, bool)>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: FnOnce() -> ExecResult<V>,
    {
        let cell = self.cell_for::<K, V>(key)?;
        let mut created = false;
        let erased = cell.get_or_try_init(|| {
            created = true;
            build().map(|value| Arc::new(value) as ErasedValue)
        })?;

        if created {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!("primitive cache miss: {}", std::any::type_name::<K>());
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!("primitive cache hit: {}", std::any::type_name::<K>());
        }

        let value = erased.clone().downcast::<V>().map_err(|_| {
            ExecutorError::execution(format!(
                "cached value for {} is not a {}",
                std::any::type_name::<K>(),
                std::any::type_name::<V>()
            ))
        })?;
        Ok((value, created))
    }

    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .map(|buckets| {
                buckets
                    .values()
                    .flatten()
                    .filter(|entry| entry.cell.get().is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
