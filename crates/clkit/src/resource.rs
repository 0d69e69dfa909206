use crate::error::{ClError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait Named {
    fn name(&self) -> &str;
}

/// An externally-backed object that must be released explicitly.
///
/// `release` is idempotent: the first call releases every registry the
/// resource owns (deepest first) and then its own handle; later calls are
/// no-ops that succeed.
pub trait Releasable {
    /// Type name used in diagnostics, e.g. `"Buffer"`.
    fn kind(&self) -> &'static str;

    fn is_released(&self) -> bool;

    fn release(&self) -> Result<()>;
}

/// Marker for anything a [`NamedRegistry`](crate::registry::NamedRegistry) can hold.
pub trait Resource: Named + Releasable + Send + Sync {}

impl<T: Named + Releasable + Send + Sync> Resource for T {}

/// The `released` bit shared by every concrete resource type.
#[derive(Debug, Default)]
pub struct ReleaseFlag(AtomicBool);

impl ReleaseFlag {
    /// Sets the flag. Returns `true` only for the call that flipped it.
    pub fn mark(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn ensure_live(&self, kind: &'static str, name: &str) -> Result<()> {
        if self.get() {
            Err(ClError::released(kind, name))
        } else {
            Ok(())
        }
    }
}

/// A resource given either by name or by reference.
pub enum Lookup<'a, R> {
    Name(&'a str),
    Ref(&'a Arc<R>),
}

impl<'a, R> From<&'a str> for Lookup<'a, R> {
    fn from(name: &'a str) -> Self {
        Lookup::Name(name)
    }
}

impl<'a, R> From<&'a String> for Lookup<'a, R> {
    fn from(name: &'a String) -> Self {
        Lookup::Name(name.as_str())
    }
}

impl<'a, R> From<&'a Arc<R>> for Lookup<'a, R> {
    fn from(resource: &'a Arc<R>) -> Self {
        Lookup::Ref(resource)
    }
}

impl<R: Named> fmt::Debug for Lookup<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Name(name) => write!(f, "{name:?}"),
            Lookup::Ref(resource) => write!(f, "<{}>", resource.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_flips_once() {
        let flag = ReleaseFlag::default();
        assert!(flag.ensure_live("Buffer", "a").is_ok());
        assert!(flag.mark());
        assert!(!flag.mark());
        assert!(flag.get());
        assert_eq!(
            flag.ensure_live("Buffer", "a"),
            Err(ClError::ResourceReleased { kind: "Buffer", name: "a".into() })
        );
    }
}
