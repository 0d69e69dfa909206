//! Name-keyed resource tracking with cascading release.

use crate::error::{ClError, Result};
use crate::resource::Resource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An insertion-ordered collection of resources, at most one per name.
///
/// Each registry carries its own lock so evict-then-insert is never observed
/// half done.
pub struct NamedRegistry<R: Resource> {
    entries: Mutex<Vec<Arc<R>>>,
    inserted: AtomicUsize,
}

impl<R: Resource> Default for NamedRegistry<R> {
    fn default() -> Self {
        Self { entries: Mutex::new(Vec::new()), inserted: AtomicUsize::new(0) }
    }
}

impl<R: Resource> NamedRegistry<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-match lookup.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<R>> {
        self.entries.lock().iter().find(|r| r.name() == name).cloned()
    }

    /// Registers `resource`, releasing and dropping any entry with the same
    /// name first.
    ///
    /// The new entry is registered even when the superseded one fails to
    /// release; that failure is logged and handed back as a warning.
    pub fn insert(&self, resource: Arc<R>) -> Option<ClError> {
        let mut entries = self.entries.lock();
        let warning = evict(&mut entries, resource.name());
        tracing::debug!(kind = resource.kind(), name = resource.name(), "registered");
        entries.push(resource);
        self.inserted.fetch_add(1, Ordering::AcqRel);
        warning
    }

    /// Releases and drops the entry called `name`. Absent names are ignored.
    pub fn remove(&self, name: &str) -> Option<ClError> {
        evict(&mut self.entries.lock(), name)
    }

    /// Releases every entry in insertion order and empties the registry.
    ///
    /// All entries are attempted; the first failure is returned.
    pub fn release_all(&self) -> Result<()> {
        let drained = std::mem::take(&mut *self.entries.lock());
        let mut first_err = None;
        for resource in drained {
            if let Err(e) = resource.release() {
                tracing::warn!(kind = resource.kind(), name = resource.name(), "release failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// The name an unnamed resource gets: the number of insertions so far,
    /// or the next number above it that no live entry is called.
    ///
    /// Auto-names therefore never evict a live entry, whether that entry was
    /// auto-named or named by the caller.
    #[must_use]
    pub fn next_name(&self) -> String {
        let entries = self.entries.lock();
        let mut n = self.inserted.load(Ordering::Acquire);
        loop {
            let name = n.to_string();
            if !entries.iter().any(|r| r.name() == name) {
                return name;
            }
            n += 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|r| r.name().to_owned()).collect()
    }

    /// A snapshot of the current entries.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<R>> {
        self.entries.lock().clone()
    }
}

/// Superseded-release failures collected by an owner's factories.
#[derive(Default)]
pub(crate) struct Warnings(Mutex<Vec<ClError>>);

impl Warnings {
    pub(crate) fn push(&self, warning: Option<ClError>) {
        if let Some(warning) = warning {
            self.0.lock().push(warning);
        }
    }

    pub(crate) fn take(&self) -> Vec<ClError> {
        std::mem::take(&mut *self.0.lock())
    }
}

fn evict<R: Resource>(entries: &mut Vec<Arc<R>>, name: &str) -> Option<ClError> {
    let pos = entries.iter().position(|r| r.name() == name)?;
    let old = entries.remove(pos);
    tracing::debug!(kind = old.kind(), name, "evicting");
    match old.release() {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(kind = old.kind(), name, "failed to release superseded entry: {e}");
            Some(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Releasable;
    use crate::testing::TestHandle;

    #[test]
    fn same_name_insert_releases_predecessor() {
        let registry = NamedRegistry::new();
        let a = TestHandle::new("results");
        let b = TestHandle::new("results");

        assert!(registry.lookup("results").is_none());
        assert!(registry.insert(a.clone()).is_none());
        assert!(Arc::ptr_eq(&registry.lookup("results").unwrap(), &a));

        assert!(registry.insert(b.clone()).is_none());
        assert!(a.is_released());
        assert!(!b.is_released());
        assert!(Arc::ptr_eq(&registry.lookup("results").unwrap(), &b));
        assert_eq!(registry.len(), 1);

        registry.release_all().unwrap();
        assert!(registry.lookup("results").is_none());
        assert!(b.is_released());
        registry.release_all().unwrap();
    }

    #[test]
    fn lookup_is_exact() {
        let registry = NamedRegistry::new();
        registry.insert(TestHandle::new("ab"));
        assert!(registry.lookup("a").is_none());
        assert!(registry.lookup("ab").is_some());
        assert!(registry.lookup("abc").is_none());
    }

    #[test]
    fn failed_release_of_superseded_entry_still_registers() {
        let registry = NamedRegistry::new();
        registry.insert(TestHandle::failing("x"));
        let replacement = TestHandle::new("x");
        let warning = registry.insert(replacement.clone());
        assert!(matches!(warning, Some(ClError::ExternalProvider(_))));
        assert!(Arc::ptr_eq(&registry.lookup("x").unwrap(), &replacement));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let registry: NamedRegistry<TestHandle> = NamedRegistry::new();
        assert!(registry.remove("nothing").is_none());
        let a = TestHandle::new("a");
        registry.insert(a.clone());
        assert!(registry.remove("a").is_none());
        assert!(a.is_released());
        assert!(registry.is_empty());
    }

    #[test]
    fn release_all_keeps_going_after_failure() {
        let registry = NamedRegistry::new();
        let bad = TestHandle::failing("bad");
        let good = TestHandle::new("good");
        registry.insert(bad.clone());
        registry.insert(good.clone());
        assert!(registry.release_all().is_err());
        assert!(bad.is_released());
        assert!(good.is_released());
        assert!(registry.is_empty());
        assert!(registry.release_all().is_ok());
    }

    #[test]
    fn release_cascades_into_nested_registries() {
        let leaf = TestHandle::new("leaf");
        let nested = NamedRegistry::new();
        nested.insert(leaf.clone());
        let parent = TestHandle::with_children("parent", nested);

        let root = NamedRegistry::new();
        root.insert(parent.clone());
        root.release_all().unwrap();

        assert!(leaf.is_released());
        assert!(parent.is_released());
        assert!(parent.children.as_ref().unwrap().is_empty());
    }

    #[test]
    fn auto_names_follow_insertion_count() {
        let registry = NamedRegistry::new();
        assert_eq!(registry.next_name(), "0");
        registry.insert(TestHandle::new(&registry.next_name()));
        registry.insert(TestHandle::new(&registry.next_name()));
        assert_eq!(registry.names(), vec!["0".to_owned(), "1".to_owned()]);

        registry.remove("0");
        registry.insert(TestHandle::new(&registry.next_name()));
        assert_eq!(registry.names(), vec!["1".to_owned(), "2".to_owned()]);
    }

    #[test]
    fn auto_names_skip_names_the_caller_chose() {
        let registry = NamedRegistry::new();
        let picked = TestHandle::new("1");
        registry.insert(picked.clone());
        assert_eq!(registry.next_name(), "2");

        let explicit_three = TestHandle::new("3");
        registry.insert(explicit_three.clone());
        registry.insert(TestHandle::new(&registry.next_name()));
        registry.insert(TestHandle::new(&registry.next_name()));
        assert_eq!(registry.names(), vec!["1", "3", "2", "4"]);
        assert!(!picked.is_released());
        assert!(!explicit_three.is_released());
    }

    #[test]
    fn racing_inserts_of_one_name_keep_exactly_one() {
        let registry = NamedRegistry::new();
        let handles: Vec<Arc<TestHandle>> = (0..16).map(|_| TestHandle::new("shared")).collect();
        std::thread::scope(|s| {
            for handle in &handles {
                let registry = &registry;
                s.spawn(move || registry.insert(Arc::clone(handle)));
            }
        });

        assert_eq!(registry.len(), 1);
        let winner = registry.lookup("shared").unwrap();
        for handle in &handles {
            assert_eq!(handle.is_released(), !Arc::ptr_eq(handle, &winner));
        }
    }
}
