//! Provider-free resources for unit tests.

use crate::error::{ProviderError, Result};
use crate::registry::NamedRegistry;
use crate::resource::{Named, ReleaseFlag, Releasable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct TestHandle {
    pub name: String,
    pub released: ReleaseFlag,
    pub fail_release: bool,
    pub children: Option<NamedRegistry<TestHandle>>,
    pub release_calls: AtomicUsize,
}

impl TestHandle {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, None))
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, None))
    }

    pub fn with_children(name: &str, children: NamedRegistry<TestHandle>) -> Arc<Self> {
        Arc::new(Self::build(name, false, Some(children)))
    }

    fn build(name: &str, fail_release: bool, children: Option<NamedRegistry<TestHandle>>) -> Self {
        Self {
            name: name.into(),
            released: ReleaseFlag::default(),
            fail_release,
            children,
            release_calls: AtomicUsize::new(0),
        }
    }
}

impl Named for TestHandle {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for TestHandle {
    fn kind(&self) -> &'static str {
        "TestHandle"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(children) = &self.children {
            children.release_all()?;
        }
        if self.fail_release {
            return Err(ProviderError::new(-38, "INVALID_MEM_OBJECT").into());
        }
        Ok(())
    }
}
