//! Contexts and the factories for everything created inside one.

use crate::args::MemoryResolver;
use crate::dispatch::{CleanupDispatcher, Owner};
use crate::error::{ClError, Result};
use crate::memory::{Buffer, Image};
use crate::program::{BuildOptions, Kernel, Program, ProgramOptions, ProgramSource};
use crate::provider::{ComputeProvider, ImageFormat, MemFlags, RawHandle};
use crate::queue::CommandQueue;
use crate::registry::{NamedRegistry, Warnings};
use crate::resource::{Named, ReleaseFlag, Releasable};
use crate::session::{Device, SessionConfig};
use crate::source::SourceLoader;
use std::fmt;
use std::sync::{Arc, Weak};

const CONTEXT_OPS: &[&str] = &[
    "create_command_queue",
    "create_buffer",
    "create_image",
    "create_program",
    "build_program",
    "build_kernels",
    "build_kernel",
];

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_IMAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub name: Option<String>,
}

impl QueueOptions {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub name: Option<String>,
    /// Bytes.
    pub size: usize,
    pub flags: MemFlags,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self { name: None, size: DEFAULT_BUFFER_SIZE, flags: MemFlags::default() }
    }
}

impl BufferOptions {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: MemFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub format: ImageFormat,
    pub flags: MemFlags,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            name: None,
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
            format: ImageFormat::default(),
            flags: MemFlags::default(),
        }
    }
}

impl ImageOptions {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }
}

/// A compute context on one device.
///
/// Owns programs, queues, buffers and images, and releases them in that
/// order before its own handle.
pub struct Context {
    name: String,
    handle: RawHandle,
    device: Arc<Device>,
    provider: Arc<dyn ComputeProvider>,
    loader: Arc<dyn SourceLoader>,
    config: SessionConfig,
    programs: NamedRegistry<Program>,
    queues: NamedRegistry<CommandQueue>,
    buffers: NamedRegistry<Buffer>,
    images: NamedRegistry<Image>,
    warnings: Warnings,
    dispatcher: CleanupDispatcher,
    released: ReleaseFlag,
    this: Weak<Context>,
}

impl Context {
    pub(crate) fn new(
        name: String,
        handle: RawHandle,
        device: Arc<Device>,
        provider: Arc<dyn ComputeProvider>,
        loader: Arc<dyn SourceLoader>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            handle,
            device,
            provider,
            loader,
            config,
            programs: NamedRegistry::new(),
            queues: NamedRegistry::new(),
            buffers: NamedRegistry::new(),
            images: NamedRegistry::new(),
            warnings: Warnings::default(),
            dispatcher: CleanupDispatcher::new("Context", CONTEXT_OPS, config.policy()),
            released: ReleaseFlag::default(),
            this: Weak::clone(this),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn ensure_live(&self) -> Result<()> {
        self.released.ensure_live("Context", &self.name)
    }

    pub fn create_command_queue(&self, options: QueueOptions) -> Result<Arc<CommandQueue>> {
        self.dispatcher.run(self, "create_command_queue", &options, || {
            self.ensure_live()?;
            let name = options.name.clone().unwrap_or_else(|| self.queues.next_name());
            let profiling = self.config.profile;
            let handle = self
                .provider
                .create_command_queue(self.handle, self.device.handle(), profiling)?;
            let queue = Arc::new(CommandQueue::new(
                name,
                handle,
                profiling,
                Weak::clone(&self.this),
                Arc::clone(&self.provider),
                self.config,
            ));
            self.warnings.push(self.queues.insert(Arc::clone(&queue)));
            Ok(queue)
        })
    }

    pub fn create_buffer(&self, options: BufferOptions) -> Result<Arc<Buffer>> {
        self.dispatcher.run(self, "create_buffer", &options, || {
            self.ensure_live()?;
            let name = options.name.clone().unwrap_or_else(|| self.buffers.next_name());
            let handle = self.provider.create_buffer(self.handle, options.flags, options.size)?;
            let buffer = Arc::new(Buffer::new(
                name,
                handle,
                options.size,
                options.flags,
                Arc::clone(&self.provider),
            ));
            self.warnings.push(self.buffers.insert(Arc::clone(&buffer)));
            Ok(buffer)
        })
    }

    pub fn create_image(&self, options: ImageOptions) -> Result<Arc<Image>> {
        self.dispatcher.run(self, "create_image", &options, || {
            self.ensure_live()?;
            let name = options.name.clone().unwrap_or_else(|| self.images.next_name());
            let handle = self.provider.create_image(
                self.handle,
                options.flags,
                options.format,
                options.width,
                options.height,
            )?;
            let image = Arc::new(Image::new(
                name,
                handle,
                options.width,
                options.height,
                options.format,
                options.flags,
                Arc::clone(&self.provider),
            ));
            self.warnings.push(self.images.insert(Arc::clone(&image)));
            Ok(image)
        })
    }

    /// Creates (but does not build) a program from a URI, source text or
    /// vendor binary.
    pub fn create_program(&self, options: impl Into<ProgramOptions>) -> Result<Arc<Program>> {
        let options = options.into();
        self.dispatcher.run(self, "create_program", &options, || self.new_program(&options))
    }

    fn new_program(&self, options: &ProgramOptions) -> Result<Arc<Program>> {
        self.ensure_live()?;
        let handle = match &options.source {
            ProgramSource::Uri(uri) => {
                let source = self.loader.load(uri)?;
                self.provider.create_program_with_source(self.handle, &source)?
            }
            ProgramSource::Source(source) if source.trim().is_empty() => {
                return Err(ClError::expecting("a non-empty program source"));
            }
            ProgramSource::Source(source) => self.provider.create_program_with_source(self.handle, source)?,
            ProgramSource::Binary(binary) if binary.is_empty() => {
                return Err(ClError::expecting("a non-empty program binary"));
            }
            ProgramSource::Binary(binary) => {
                self.provider
                    .create_program_with_binary(self.handle, self.device.handle(), binary)?
            }
        };
        let name = options.name.clone().unwrap_or_else(|| self.programs.next_name());
        let program = Arc::new(Program::new(
            name,
            handle,
            Arc::clone(&self.device),
            Weak::clone(&self.this),
            Arc::clone(&self.provider),
            self.config,
        ));
        self.warnings.push(self.programs.insert(Arc::clone(&program)));
        Ok(program)
    }

    /// Creates a program and builds it.
    pub fn build_program(&self, options: impl Into<ProgramOptions>, build: &BuildOptions) -> Result<Arc<Program>> {
        let options = options.into();
        self.dispatcher.run(self, "build_program", &(&options, build), || {
            let program = self.create_program(options.clone())?;
            program.build(build)?;
            Ok(program)
        })
    }

    /// Creates and builds a program, returning all of its kernels.
    pub fn build_kernels(&self, options: impl Into<ProgramOptions>, build: &BuildOptions) -> Result<Vec<Arc<Kernel>>> {
        let options = options.into();
        self.dispatcher.run(self, "build_kernels", &(&options, build), || {
            Ok(self.build_program(options.clone(), build)?.kernels())
        })
    }

    /// Creates and builds a program, returning its first kernel.
    pub fn build_kernel(&self, options: impl Into<ProgramOptions>, build: &BuildOptions) -> Result<Arc<Kernel>> {
        let options = options.into();
        self.dispatcher.run(self, "build_kernel", &(&options, build), || {
            let program = self.build_program(options.clone(), build)?;
            program.kernel().ok_or_else(|| ClError::expecting("a program with at least one kernel"))
        })
    }

    #[must_use]
    pub fn get_buffer(&self, name: &str) -> Option<Arc<Buffer>> {
        self.buffers.lookup(name)
    }

    #[must_use]
    pub fn get_image(&self, name: &str) -> Option<Arc<Image>> {
        self.images.lookup(name)
    }

    #[must_use]
    pub fn get_program(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.lookup(name)
    }

    #[must_use]
    pub fn get_queue(&self, name: &str) -> Option<Arc<CommandQueue>> {
        self.queues.lookup(name)
    }

    /// Searches every program, oldest first.
    #[must_use]
    pub fn get_kernel(&self, name: &str) -> Option<Arc<Kernel>> {
        self.programs.entries().iter().find_map(|p| p.get_kernel(name))
    }

    #[must_use]
    pub fn buffers(&self) -> Vec<Arc<Buffer>> {
        self.buffers.entries()
    }

    #[must_use]
    pub fn images(&self) -> Vec<Arc<Image>> {
        self.images.entries()
    }

    #[must_use]
    pub fn programs(&self) -> Vec<Arc<Program>> {
        self.programs.entries()
    }

    #[must_use]
    pub fn queues(&self) -> Vec<Arc<CommandQueue>> {
        self.queues.entries()
    }

    /// Drains the failures to release entries that same-named ones replaced,
    /// oldest first.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<ClError> {
        self.warnings.take()
    }

    pub fn release_buffer(&self, name: &str) -> Option<ClError> {
        self.buffers.remove(name)
    }

    pub fn release_image(&self, name: &str) -> Option<ClError> {
        self.images.remove(name)
    }

    pub fn release_program(&self, name: &str) -> Option<ClError> {
        self.programs.remove(name)
    }

    pub fn release_queue(&self, name: &str) -> Option<ClError> {
        self.queues.remove(name)
    }

    fn release_children(&self) -> Result<()> {
        let results = [
            self.programs.release_all(),
            self.queues.release_all(),
            self.buffers.release_all(),
            self.images.release_all(),
        ];
        results.into_iter().collect()
    }
}

impl MemoryResolver for Context {
    fn resolve_buffer(&self, name: &str) -> Option<Arc<Buffer>> {
        self.buffers.lookup(name)
    }

    fn resolve_image(&self, name: &str) -> Option<Arc<Image>> {
        self.images.lookup(name)
    }
}

impl Named for Context {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for Context {
    fn kind(&self) -> &'static str {
        "Context"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        let children = self.release_children();
        self.provider.release(self.handle)?;
        tracing::debug!(context = %self.name, "released");
        children
    }
}

impl Owner for Context {
    fn release_all(&self) -> Result<()> {
        self.release_children()
    }

    fn snapshot(&self) -> String {
        format!(
            "Context {{ name: {:?}, device: {}, programs: {:?}, queues: {:?}, buffers: {:?}, images: {:?} }}",
            self.name,
            self.device.id(),
            self.programs.names(),
            self.queues.names(),
            self.buffers.names(),
            self.images.names()
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}
