//! Command queues and the events they produce.

use crate::context::Context;
use crate::dispatch::{CleanupDispatcher, Owner};
use crate::error::{ClError, Result};
use crate::memory::Buffer;
use crate::program::Kernel;
use crate::provider::{ComputeProvider, RawHandle};
use crate::registry::{NamedRegistry, Warnings};
use crate::resource::{Lookup, Named, ReleaseFlag, Releasable};
use crate::session::SessionConfig;
use bytemuck::Pod;
use std::fmt;
use std::sync::{Arc, Weak};

const QUEUE_OPS: &[&str] = &[
    "enqueue_kernel",
    "enqueue_write_buffer",
    "enqueue_read_buffer",
    "enqueue_barrier",
    "finish",
];

/// Completion token for one enqueued command.
pub struct Event {
    name: String,
    handle: RawHandle,
    command: &'static str,
    provider: Arc<dyn ComputeProvider>,
    released: ReleaseFlag,
}

impl Event {
    /// The queue operation that produced the event.
    #[must_use]
    pub fn command(&self) -> &'static str {
        self.command
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.handle
    }
}

impl Named for Event {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for Event {
    fn kind(&self) -> &'static str {
        "Event"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        self.provider.release(self.handle)?;
        Ok(())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({} {})", self.name, self.command)
    }
}

pub struct CommandQueue {
    name: String,
    handle: RawHandle,
    profiling: bool,
    context: Weak<Context>,
    provider: Arc<dyn ComputeProvider>,
    events: NamedRegistry<Event>,
    warnings: Warnings,
    dispatcher: CleanupDispatcher,
    released: ReleaseFlag,
}

impl CommandQueue {
    pub(crate) fn new(
        name: String,
        handle: RawHandle,
        profiling: bool,
        context: Weak<Context>,
        provider: Arc<dyn ComputeProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            name,
            handle,
            profiling,
            context,
            provider,
            events: NamedRegistry::new(),
            warnings: Warnings::default(),
            dispatcher: CleanupDispatcher::new("CommandQueue", QUEUE_OPS, config.policy()),
            released: ReleaseFlag::default(),
        }
    }

    #[must_use]
    pub fn profiling_enabled(&self) -> bool {
        self.profiling
    }

    /// Every event recorded and not yet released, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.events.entries()
    }

    fn checked_handle(&self) -> Result<RawHandle> {
        self.released.ensure_live("CommandQueue", &self.name)?;
        Ok(self.handle)
    }

    fn context(&self) -> Result<Arc<Context>> {
        self.context
            .upgrade()
            .ok_or_else(|| ClError::released("Context", "<dropped>"))
    }

    fn resolve_buffer(&self, buffer: &Lookup<'_, Buffer>) -> Result<Arc<Buffer>> {
        match buffer {
            Lookup::Ref(buffer) => Ok(Arc::clone(buffer)),
            Lookup::Name(name) => self
                .context()?
                .get_buffer(name)
                .ok_or_else(|| ClError::UnresolvedName { kind: "Buffer", name: (*name).to_owned() }),
        }
    }

    fn record(&self, command: &'static str, handle: RawHandle) -> Arc<Event> {
        let event = Arc::new(Event {
            name: self.events.next_name(),
            handle,
            command,
            provider: Arc::clone(&self.provider),
            released: ReleaseFlag::default(),
        });
        self.warnings.push(self.events.insert(Arc::clone(&event)));
        event
    }

    /// Writes `data` into `buffer`, truncated to the buffer's size.
    pub fn enqueue_write_buffer<'a, T: Pod>(
        &self,
        buffer: impl Into<Lookup<'a, Buffer>>,
        data: &[T],
    ) -> Result<Arc<Event>> {
        let buffer = buffer.into();
        self.dispatcher.run(self, "enqueue_write_buffer", &buffer, || {
            let queue = self.checked_handle()?;
            let buffer = self.resolve_buffer(&buffer)?;
            let bytes: &[u8] = bytemuck::cast_slice(data);
            let len = buffer.size().min(bytes.len());
            let event = self
                .provider
                .enqueue_write_buffer(queue, buffer.checked_handle()?, &bytes[..len])?;
            Ok(self.record("enqueue_write_buffer", event))
        })
    }

    /// Reads from `buffer` into `out`, up to the smaller of the two sizes.
    pub fn enqueue_read_buffer<'a, T: Pod>(
        &self,
        buffer: impl Into<Lookup<'a, Buffer>>,
        out: &mut [T],
    ) -> Result<Arc<Event>> {
        let buffer = buffer.into();
        self.dispatcher.run(self, "enqueue_read_buffer", &buffer, || {
            let queue = self.checked_handle()?;
            let buffer = self.resolve_buffer(&buffer)?;
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
            let len = buffer.size().min(bytes.len());
            let event = self
                .provider
                .enqueue_read_buffer(queue, buffer.checked_handle()?, &mut bytes[..len])?;
            Ok(self.record("enqueue_read_buffer", event))
        })
    }

    /// Enqueues `kernel` over `global` work items. An empty `local` leaves
    /// the work-group size to the provider.
    pub fn enqueue_kernel<'a>(
        &self,
        kernel: impl Into<Lookup<'a, Kernel>>,
        global: &[usize],
        local: &[usize],
    ) -> Result<Arc<Event>> {
        let kernel = kernel.into();
        self.dispatcher.run(self, "enqueue_kernel", &(&kernel, global, local), || {
            let queue = self.checked_handle()?;
            let kernel = match &kernel {
                Lookup::Ref(kernel) => Arc::clone(kernel),
                Lookup::Name(name) => self
                    .context()?
                    .get_kernel(name)
                    .ok_or_else(|| ClError::UnresolvedName { kind: "Kernel", name: (*name).to_owned() })?,
            };
            let event = self
                .provider
                .enqueue_kernel(queue, kernel.checked_handle()?, global, local)?;
            Ok(self.record("enqueue_kernel", event))
        })
    }

    /// Waits for `wait_for` (or for everything enqueued so far when empty),
    /// then returns a marker event for the barrier.
    pub fn enqueue_barrier(&self, wait_for: &[Arc<Event>]) -> Result<Arc<Event>> {
        self.dispatcher.run(self, "enqueue_barrier", &wait_for, || {
            let queue = self.checked_handle()?;
            let mut wait_list = Vec::with_capacity(wait_for.len());
            for event in wait_for {
                event.released.ensure_live("Event", &event.name)?;
                wait_list.push(event.handle);
            }
            self.provider.enqueue_barrier(queue, &wait_list)?;
            let marker = self.provider.enqueue_marker(queue)?;
            Ok(self.record("enqueue_barrier", marker))
        })
    }

    /// Blocks until every enqueued command has completed.
    pub fn finish(&self) -> Result<()> {
        self.dispatcher.run(self, "finish", &(), || {
            self.provider.finish(self.checked_handle()?)?;
            Ok(())
        })
    }

    /// Drains the failures to release entries that same-named ones replaced,
    /// oldest first.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<ClError> {
        self.warnings.take()
    }

    /// Releases every recorded event.
    pub fn release_events(&self) -> Result<()> {
        self.events.release_all()
    }
}

impl Named for CommandQueue {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for CommandQueue {
    fn kind(&self) -> &'static str {
        "CommandQueue"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        let events = self.events.release_all();
        self.provider.release(self.handle)?;
        events
    }
}

impl Owner for CommandQueue {
    fn release_all(&self) -> Result<()> {
        self.events.release_all()
    }

    fn snapshot(&self) -> String {
        format!(
            "CommandQueue {{ name: {:?}, profiling: {}, events: {} }}",
            self.name,
            self.profiling,
            self.events.len()
        )
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}
