//! The compute capability provider interface.
//!
//! Everything that does real work (device discovery, compilation, dispatch,
//! transfers) lives behind [`ComputeProvider`]. The rest of the crate only
//! names, tracks and releases the handles it hands out.

use crate::args::{ArgKind, KernelArg};
use crate::error::ProviderError;
use std::fmt;

#[cfg(feature = "mock")]
pub mod mock;

/// Opaque handle to a provider-side object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Gpu => write!(f, "GPU"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub handle: RawHandle,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: DeviceType,
    pub available: bool,
    pub compiler_available: bool,
    /// Space-separated extension string, as reported by the provider.
    pub extensions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDesc {
    pub handle: RawHandle,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub extensions: String,
    pub devices: Vec<DeviceDesc>,
}

/// Access flags for memory objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemFlags {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelOrder {
    #[default]
    Rgba,
    Bgra,
    R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelType {
    #[default]
    UnsignedInt8,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Error,
    None,
}

/// A kernel extracted from a built program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDesc {
    pub handle: RawHandle,
    pub function_name: String,
    pub args: Vec<ArgKind>,
    pub work_group_size: usize,
    pub local_mem_size: u64,
    pub private_mem_size: u64,
}

pub trait ComputeProvider: Send + Sync + 'static {
    /// Every platform in the system with every device it reports, available
    /// or not. Filtering is left to the caller.
    fn platforms(&self) -> Result<Vec<PlatformDesc>, ProviderError>;

    fn create_context(&self, devices: &[RawHandle]) -> Result<RawHandle, ProviderError>;

    fn create_buffer(
        &self,
        context: RawHandle,
        flags: MemFlags,
        size: usize,
    ) -> Result<RawHandle, ProviderError>;

    fn create_image(
        &self,
        context: RawHandle,
        flags: MemFlags,
        format: ImageFormat,
        width: usize,
        height: usize,
    ) -> Result<RawHandle, ProviderError>;

    fn create_program_with_source(
        &self,
        context: RawHandle,
        source: &str,
    ) -> Result<RawHandle, ProviderError>;

    /// Creates a program from a vendor-specific binary such as NVIDIA PTX.
    fn create_program_with_binary(
        &self,
        context: RawHandle,
        device: RawHandle,
        binary: &[u8],
    ) -> Result<RawHandle, ProviderError>;

    fn build_program(
        &self,
        program: RawHandle,
        device: RawHandle,
        options: &str,
    ) -> Result<(), ProviderError>;

    fn build_status(&self, program: RawHandle, device: RawHandle) -> Result<BuildStatus, ProviderError>;

    fn build_log(&self, program: RawHandle, device: RawHandle) -> Result<String, ProviderError>;

    fn create_kernels(&self, program: RawHandle) -> Result<Vec<KernelDesc>, ProviderError>;

    fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        profiling: bool,
    ) -> Result<RawHandle, ProviderError>;

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: &KernelArg) -> Result<(), ProviderError>;

    /// Non-blocking write of `src` into `buffer`. The caller has already
    /// clamped `src` to the buffer size.
    fn enqueue_write_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        src: &[u8],
    ) -> Result<RawHandle, ProviderError>;

    /// Read of `dst.len()` bytes from `buffer` into `dst`. The caller has
    /// already clamped `dst` to the buffer size.
    fn enqueue_read_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        dst: &mut [u8],
    ) -> Result<RawHandle, ProviderError>;

    fn enqueue_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        global: &[usize],
        local: &[usize],
    ) -> Result<RawHandle, ProviderError>;

    /// Waits for `wait_list`, or for every previously enqueued command when
    /// the list is empty.
    fn enqueue_barrier(&self, queue: RawHandle, wait_list: &[RawHandle]) -> Result<(), ProviderError>;

    fn enqueue_marker(&self, queue: RawHandle) -> Result<RawHandle, ProviderError>;

    fn finish(&self, queue: RawHandle) -> Result<(), ProviderError>;

    fn release(&self, handle: RawHandle) -> Result<(), ProviderError>;
}

/// Splits a space-separated extension string, dropping empty entries.
#[must_use]
pub fn split_extensions(extensions: &str) -> Vec<String> {
    extensions
        .split(' ')
        .filter(|ext| !ext.is_empty())
        .map(str::to_owned)
        .collect()
}
