//! Typed lazy per-build values.
//!
//! A [`Key`] carries a mark and a deterministic initializer; [`Store::get`]
//! materializes the key's future on first lookup, running the initializer
//! under a sub-memoizer marked with the key's mark, and returns the cached
//! future afterwards. Keys allocate process-unique ids, and lookups downcast
//! behind that id: retrieving a key bound under a different type is a
//! structural invariant violation and panics.

use crate::fiber::Fut;
use crate::memo::Memo;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(0);

pub struct Key<T> {
    id: u64,
    mark: String,
    det: Rc<dyn Fn(&Store, &Memo) -> Fut<T>>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Key {
            id: self.id,
            mark: self.mark.clone(),
            det: Rc::clone(&self.det),
            _value: PhantomData,
        }
    }
}

impl<T: Clone + 'static> Key<T> {
    pub fn new(mark: &str, det: impl Fn(&Store, &Memo) -> Fut<T> + 'static) -> Key<T> {
        Key {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            mark: mark.to_string(),
            det: Rc::new(det),
            _value: PhantomData,
        }
    }

    pub fn mark(&self) -> &str {
        &self.mark
    }
}

struct StoreInner {
    memo: Memo,
    dir: PathBuf,
    bindings: HashMap<u64, Box<dyn Any>>,
}

/// A per-build map from keys to their futures, with a scratch directory.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreInner>>,
}

impl Store {
    pub fn new(memo: &Memo, dir: impl Into<PathBuf>) -> Store {
        Store {
            inner: Rc::new(RefCell::new(StoreInner {
                memo: memo.clone(),
                dir: dir.into(),
                bindings: HashMap::new(),
            })),
        }
    }

    pub fn memo(&self) -> Memo {
        self.inner.borrow().memo.clone()
    }

    /// Scratch directory for key initializers.
    pub fn dir(&self) -> PathBuf {
        self.inner.borrow().dir.clone()
    }

    pub fn with_dir(&self, dir: impl AsRef<Path>) -> Store {
        Store {
            inner: Rc::new(RefCell::new(StoreInner {
                memo: self.memo(),
                dir: dir.as_ref().to_path_buf(),
                bindings: HashMap::new(),
            })),
        }
    }

    /// The future bound to `key`, materialized on first lookup.
    pub fn get<T: Clone + 'static>(&self, key: &Key<T>) -> Fut<T> {
        if let Some(bound) = self.inner.borrow().bindings.get(&key.id) {
            return bound
                .downcast_ref::<Fut<T>>()
                .expect("store key bound under a different type")
                .clone();
        }
        let memo = self.inner.borrow().memo.with_mark(&key.mark);
        let fut = (key.det)(self, &memo);
        self.inner
            .borrow_mut()
            .bindings
            .insert(key.id, Box::new(fut.clone()));
        fut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn memo(dir: &Path) -> Memo {
        Memo::builder()
            .cwd(dir)
            .cache_dir(dir.join("cache"))
            .trash_dir(dir.join("trash"))
            .tmp_dir(dir.join("tmp"))
            .jobs(1)
            .build()
            .unwrap()
    }

    #[test]
    fn initializer_runs_once() {
        let tmp = tempfile::tempdir().unwrap();
        let m = memo(tmp.path());
        let store = Store::new(&m, tmp.path().join("scratch"));

        let runs = Rc::new(Cell::new(0));
        let counted = Rc::clone(&runs);
        let key: Key<u32> = Key::new("answers", move |_, m| {
            counted.set(counted.get() + 1);
            let fut = m.fut();
            fut.set(42);
            fut
        });

        let first = store.get(&key);
        let second = store.get(&key);
        assert_eq!(runs.get(), 1);
        assert_eq!(first.get(), Some(42));
        assert_eq!(second.get(), Some(42));
    }

    #[test]
    fn initializer_sees_the_key_mark() {
        let tmp = tempfile::tempdir().unwrap();
        let m = memo(tmp.path());
        let store = Store::new(&m, tmp.path().join("scratch"));

        let key: Key<String> = Key::new("unit-maps", |_, m| {
            let fut = m.fut();
            fut.set(m.mark().to_string());
            fut
        });
        assert_eq!(store.get(&key).get().as_deref(), Some("unit-maps"));
    }

    #[test]
    fn distinct_keys_have_distinct_bindings() {
        let tmp = tempfile::tempdir().unwrap();
        let m = memo(tmp.path());
        let store = Store::new(&m, tmp.path().join("scratch"));

        let a: Key<u32> = Key::new("a", |_, m| {
            let fut = m.fut();
            fut.set(1);
            fut
        });
        let b: Key<u32> = Key::new("b", |_, m| {
            let fut = m.fut();
            fut.set(2);
            fut
        });
        assert_eq!(store.get(&a).get(), Some(1));
        assert_eq!(store.get(&b).get(), Some(2));
    }
}
