//! Resource records and their reference counts
//!
//! Sessions, trees and handles live in arenas keyed by stable ids. Children
//! hold a counted reference to their parent record, never a pointer.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

macro_rules! record_key {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                $name(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

record_key!(SessionKey, "session");
record_key!(TreeKey, "tree");
record_key!(HandleKey, "handle");

/// Atomic reference count that refuses to resurrect or underflow.
#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn new(initial: usize) -> Self {
        Self(AtomicUsize::new(initial))
    }

    /// Take another reference, unless the count already reached zero and
    /// the record is being torn down.
    pub fn try_acquire(&self) -> Result<usize> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    n.checked_add(1)
                }
            })
            .map(|previous| previous + 1)
            .map_err(|_| Error::LifecycleViolation("acquire on a released resource".into()))
    }

    /// Drop one reference. `Ok(true)` when this was the last one.
    pub fn release(&self) -> Result<bool> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .map_err(|_| Error::LifecycleViolation("release without a matching acquire".into()))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Records of one kind, addressed by key
pub struct Arena<K, T> {
    entries: RwLock<HashMap<K, Arc<T>>>,
    next_id: AtomicU64,
}

impl<K, T> Arena<K, T>
where
    K: Copy + Eq + Hash + From<u64>,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a key and store the record built for it.
    pub fn insert_with(&self, build: impl FnOnce(K) -> T) -> Arc<T> {
        let key = K::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(build(key));
        self.entries.write().insert(key, record.clone());
        record
    }

    pub fn get(&self, key: K) -> Option<Arc<T>> {
        self.entries.read().get(&key).cloned()
    }

    /// Like [`get`](Self::get), failing with a lifecycle violation.
    pub fn require(&self, key: K) -> Result<Arc<T>>
    where
        K: fmt::Display,
    {
        self.get(key)
            .ok_or_else(|| Error::LifecycleViolation(format!("{} no longer exists", key)))
    }

    pub fn remove(&self, key: K) -> Option<Arc<T>> {
        self.entries.write().remove(&key)
    }

    /// First record matching `predicate`
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.entries
            .read()
            .values()
            .find(|record| predicate(record))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, T> Default for Arena<K, T>
where
    K: Copy + Eq + Hash + From<u64>,
{
    fn default() -> Self {
        Self::new()
    }
}
