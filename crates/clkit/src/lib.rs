//! Named-resource convenience layer over an OpenCL-style compute provider.
//!
//! A [`Session`] discovers devices and owns contexts; a [`Context`] owns the
//! buffers, images, programs and queues created in it. Every resource gets a
//! name and can be looked up by it later. Failing operations release what
//! their owner holds and report `Owner.operation: message`.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod args;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod program;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod session;
pub mod source;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use args::{normalize, ArgKind, ArgValue, KernelArg, MemoryResolver, ScalarType, TypedArray};
pub use context::{BufferOptions, Context, ImageOptions, QueueOptions};
pub use dispatch::{CleanupDispatcher, Owner, Policy};
pub use error::{ClError, ProviderError, Result};
pub use memory::{Buffer, Image};
pub use program::{BuildOptions, Kernel, Program, ProgramOptions, ProgramSource};
pub use provider::{ComputeProvider, DeviceType, ImageFormat, MemFlags, RawHandle};
pub use queue::{CommandQueue, Event};
pub use registry::NamedRegistry;
pub use resource::{Lookup, Named, Releasable, Resource};
pub use session::{ContextOptions, Device, Platform, Session, SessionConfig};
pub use source::{FileSourceLoader, MemorySourceLoader, SourceLoader};

#[cfg(feature = "mock")]
pub use provider::mock::MockProvider;

/// The provider used when the caller does not bring one.
#[must_use]
pub fn default_provider() -> Arc<dyn ComputeProvider> {
    #[cfg(feature = "mock")]
    {
        tracing::info!("Using MockProvider.");
        Arc::new(MockProvider::new())
    }

    #[cfg(not(feature = "mock"))]
    {
        compile_error!("No compute provider available. Enable the 'mock' feature or pass a provider to Session::new.");
    }
}
