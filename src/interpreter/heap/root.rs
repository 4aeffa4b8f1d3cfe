use std::rc::{Rc, Weak};

/// A host handle rooting one heap object.
///
/// The handle owns a unit guard and the heap keeps only a weak view of
/// it, so liveness is simply whether any clone of the guard still
/// exists: drop every handle and the next sweep reclaims the object.
/// All handles to the same object share one guard.
pub(crate) struct HeapRef<K> {
    key: K,
    guard: Rc<()>,
}

impl<K: Copy> HeapRef<K> {
    pub(crate) fn key(&self) -> K {
        self.key
    }
}

impl<K: Clone> Clone for HeapRef<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<K: PartialEq> PartialEq for HeapRef<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Eq> Eq for HeapRef<K> {}

impl<K: std::fmt::Debug> std::fmt::Debug for HeapRef<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.key)
    }
}

impl<K: std::hash::Hash> std::hash::Hash for HeapRef<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// The heap-side view of the handles out for one object.
pub(crate) struct RootWatch(Weak<()>);

impl RootWatch {
    /// Whether any handle still exists.
    pub(crate) fn is_held(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Joins the existing guard, if any handle still holds it.
    fn join(&self) -> Option<Rc<()>> {
        self.0.upgrade()
    }
}

/// Starts rooting `key`: a first handle plus the watch the heap keeps.
pub(crate) fn new_root<K>(key: K) -> (HeapRef<K>, RootWatch) {
    let guard = Rc::new(());
    let watch = RootWatch(Rc::downgrade(&guard));

    (HeapRef { key, guard }, watch)
}

/// Another handle to an already-watched object, sharing its guard.
/// `None` when every prior handle is gone and the watch is stale.
pub(crate) fn join_root<K>(key: K, watch: &RootWatch) -> Option<HeapRef<K>> {
    let guard = watch.join()?;
    Some(HeapRef { key, guard })
}
