use crate::error::Result;
use crate::provider::{ComputeProvider, ImageFormat, MemFlags, RawHandle};
use crate::resource::{Named, ReleaseFlag, Releasable};
use std::fmt;
use std::sync::Arc;

/// A device buffer created by [`Context::create_buffer`](crate::Context::create_buffer).
pub struct Buffer {
    name: String,
    handle: RawHandle,
    size: usize,
    flags: MemFlags,
    provider: Arc<dyn ComputeProvider>,
    released: ReleaseFlag,
}

impl Buffer {
    pub(crate) fn new(
        name: String,
        handle: RawHandle,
        size: usize,
        flags: MemFlags,
        provider: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self { name, handle, size, flags, provider, released: ReleaseFlag::default() }
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    /// The provider handle, or `ResourceReleased`.
    pub fn checked_handle(&self) -> Result<RawHandle> {
        self.released.ensure_live("Buffer", &self.name)?;
        Ok(self.handle)
    }
}

impl Named for Buffer {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for Buffer {
    fn kind(&self) -> &'static str {
        "Buffer"
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

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("released", &self.released.get())
            .finish()
    }
}

/// A 2D image created by [`Context::create_image`](crate::Context::create_image).
pub struct Image {
    name: String,
    handle: RawHandle,
    width: usize,
    height: usize,
    format: ImageFormat,
    flags: MemFlags,
    provider: Arc<dyn ComputeProvider>,
    released: ReleaseFlag,
}

impl Image {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        handle: RawHandle,
        width: usize,
        height: usize,
        format: ImageFormat,
        flags: MemFlags,
        provider: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            name,
            handle,
            width,
            height,
            format,
            flags,
            provider,
            released: ReleaseFlag::default(),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn checked_handle(&self) -> Result<RawHandle> {
        self.released.ensure_live("Image", &self.name)?;
        Ok(self.handle)
    }
}

impl Named for Image {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for Image {
    fn kind(&self) -> &'static str {
        "Image"
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

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("released", &self.released.get())
            .finish()
    }
}
