//! Programs and the kernels built from them.

use crate::args::{normalize, ArgKind, ArgValue};
use crate::context::Context;
use crate::dispatch::{CleanupDispatcher, Owner};
use crate::error::{ClError, Result};
use crate::provider::{BuildStatus, ComputeProvider, KernelDesc, RawHandle};
use crate::registry::{NamedRegistry, Warnings};
use crate::resource::{Named, ReleaseFlag, Releasable};
use crate::session::{Device, SessionConfig};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const PROGRAM_OPS: &[&str] = &["build"];
const KERNEL_OPS: &[&str] = &["set_arg", "set_args"];

const NO_KERNELS: &str = "Kernel compilation failed, although the compiler claims it succeeded.";

/// Where a program's code comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    /// A `.cl` file, fetched through the session's source loader.
    Uri(String),
    Source(String),
    /// A vendor binary such as NVIDIA PTX.
    Binary(Vec<u8>),
}

impl From<&str> for ProgramSource {
    /// Strings ending in `.cl` are URIs; anything else is source text.
    fn from(s: &str) -> Self {
        if s.ends_with(".cl") {
            ProgramSource::Uri(s.to_owned())
        } else {
            ProgramSource::Source(s.to_owned())
        }
    }
}

impl From<String> for ProgramSource {
    fn from(s: String) -> Self {
        if s.ends_with(".cl") {
            ProgramSource::Uri(s)
        } else {
            ProgramSource::Source(s)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOptions {
    pub name: Option<String>,
    pub source: ProgramSource,
}

impl ProgramOptions {
    pub fn new(source: impl Into<ProgramSource>) -> Self {
        Self { name: None, source: source.into() }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<&str> for ProgramOptions {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProgramOptions {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<ProgramSource> for ProgramOptions {
    fn from(source: ProgramSource) -> Self {
        Self { name: None, source }
    }
}

/// Compiler options plus preprocessor defines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub opts: String,
    pub defines: BTreeMap<String, String>,
}

impl BuildOptions {
    #[must_use]
    pub fn opts(mut self, opts: impl Into<String>) -> Self {
        self.opts = opts.into();
        self
    }

    #[must_use]
    pub fn define(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.defines.insert(name.into(), value.to_string());
        self
    }
}

impl fmt::Display for BuildOptions {
    /// `-DNAME=VALUE ` for every define, then the raw options.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.defines {
            write!(f, "-D{name}={value} ")?;
        }
        f.write_str(&self.opts)
    }
}

pub struct Program {
    name: String,
    handle: RawHandle,
    device: Arc<Device>,
    context: Weak<Context>,
    provider: Arc<dyn ComputeProvider>,
    kernels: NamedRegistry<Kernel>,
    warnings: Warnings,
    built: AtomicBool,
    config: SessionConfig,
    dispatcher: CleanupDispatcher,
    released: ReleaseFlag,
}

impl Program {
    pub(crate) fn new(
        name: String,
        handle: RawHandle,
        device: Arc<Device>,
        context: Weak<Context>,
        provider: Arc<dyn ComputeProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            name,
            handle,
            device,
            context,
            provider,
            kernels: NamedRegistry::new(),
            warnings: Warnings::default(),
            built: AtomicBool::new(false),
            config,
            dispatcher: CleanupDispatcher::new("Program", PROGRAM_OPS, config.policy()),
            released: ReleaseFlag::default(),
        }
    }

    /// Compiles the program for its context's device and creates one kernel
    /// per kernel function, named after the function.
    ///
    /// Rebuilding replaces kernels of the same name.
    pub fn build(&self, options: &BuildOptions) -> Result<()> {
        self.dispatcher.run(self, "build", options, || {
            self.released.ensure_live("Program", &self.name)?;
            self.built.store(false, Ordering::Release);
            let device = self.device.handle();
            let opts = options.to_string();
            if let Err(e) = self.provider.build_program(self.handle, device, &opts) {
                return Err(self.build_failed(&e.to_string()));
            }
            if self.provider.build_status(self.handle, device)? != BuildStatus::Success {
                return Err(self.build_failed("build did not succeed"));
            }
            let descs = self.provider.create_kernels(self.handle)?;
            if descs.is_empty() {
                return Err(self.build_failed(NO_KERNELS));
            }
            for desc in descs {
                let kernel = Kernel::new(desc, Weak::clone(&self.context), Arc::clone(&self.provider), self.config);
                self.warnings.push(self.kernels.insert(Arc::new(kernel)));
            }
            self.built.store(true, Ordering::Release);
            tracing::debug!(program = %self.name, kernels = ?self.kernels.names(), "built");
            Ok(())
        })
    }

    fn build_failed(&self, message: &str) -> ClError {
        let log = self
            .provider
            .build_log(self.handle, self.device.handle())
            .unwrap_or_default();
        let vendor = self.device.platform_vendor().to_owned();
        tracing::error!(program = %self.name, %vendor, "{message}\n{log}");
        ClError::BuildFailed { vendor, message: message.to_owned(), log }
    }

    #[must_use]
    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    /// The first kernel, if the program has been built.
    #[must_use]
    pub fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernels.entries().into_iter().next()
    }

    #[must_use]
    pub fn get_kernel(&self, name: &str) -> Option<Arc<Kernel>> {
        self.kernels.lookup(name)
    }

    #[must_use]
    pub fn kernels(&self) -> Vec<Arc<Kernel>> {
        self.kernels.entries()
    }

    /// Drains the failures to release entries that same-named ones replaced,
    /// oldest first.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<ClError> {
        self.warnings.take()
    }
}

impl Named for Program {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Releasable for Program {
    fn kind(&self) -> &'static str {
        "Program"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        let kernels = self.kernels.release_all();
        self.provider.release(self.handle)?;
        kernels
    }
}

impl Owner for Program {
    fn release_all(&self) -> Result<()> {
        self.kernels.release_all()
    }

    fn snapshot(&self) -> String {
        format!(
            "Program {{ name: {:?}, built: {}, kernels: {:?} }}",
            self.name,
            self.is_built(),
            self.kernels.names()
        )
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}

/// A kernel function of a built program.
pub struct Kernel {
    desc: KernelDesc,
    context: Weak<Context>,
    provider: Arc<dyn ComputeProvider>,
    dispatcher: CleanupDispatcher,
    released: ReleaseFlag,
}

impl Kernel {
    fn new(desc: KernelDesc, context: Weak<Context>, provider: Arc<dyn ComputeProvider>, config: SessionConfig) -> Self {
        Self {
            desc,
            context,
            provider,
            dispatcher: CleanupDispatcher::new("Kernel", KERNEL_OPS, config.policy()),
            released: ReleaseFlag::default(),
        }
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.desc.function_name
    }

    #[must_use]
    pub fn num_args(&self) -> usize {
        self.desc.args.len()
    }

    #[must_use]
    pub fn arg_kinds(&self) -> &[ArgKind] {
        &self.desc.args
    }

    #[must_use]
    pub fn work_group_size(&self) -> usize {
        self.desc.work_group_size
    }

    #[must_use]
    pub fn local_mem_size(&self) -> u64 {
        self.desc.local_mem_size
    }

    #[must_use]
    pub fn private_mem_size(&self) -> u64 {
        self.desc.private_mem_size
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.desc.handle
    }

    pub(crate) fn checked_handle(&self) -> Result<RawHandle> {
        self.released.ensure_live("Kernel", &self.desc.function_name)?;
        Ok(self.desc.handle)
    }

    /// Sets argument `index`. Names are resolved against the kernel's
    /// context, buffers first.
    pub fn set_arg(&self, index: usize, value: impl Into<ArgValue>) -> Result<()> {
        let value = value.into();
        self.dispatcher.run(self, "set_arg", &(index, &value), || self.apply(index, &value))
    }

    /// Sets arguments `0..values.len()` in order, stopping at the first failure.
    pub fn set_args(&self, values: &[ArgValue]) -> Result<()> {
        self.dispatcher.run(self, "set_args", &values, || {
            for (index, value) in values.iter().enumerate() {
                self.set_arg(index, value.clone())?;
            }
            Ok(())
        })
    }

    fn apply(&self, index: usize, value: &ArgValue) -> Result<()> {
        let handle = self.checked_handle()?;
        let Some(&kind) = self.desc.args.get(index) else {
            return Err(ClError::expecting(&format!(
                "an argument index below {} for kernel '{}'",
                self.num_args(),
                self.desc.function_name
            )));
        };
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| ClError::released("Context", "<dropped>"))?;
        let arg = normalize(kind, value, &*context)?;
        let index = u32::try_from(index).map_err(|_| ClError::expecting("an argument index that fits in 32 bits"))?;
        self.provider.set_kernel_arg(handle, index, &arg)?;
        Ok(())
    }
}

impl Named for Kernel {
    fn name(&self) -> &str {
        &self.desc.function_name
    }
}

impl Releasable for Kernel {
    fn kind(&self) -> &'static str {
        "Kernel"
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release(&self) -> Result<()> {
        if !self.released.mark() {
            return Ok(());
        }
        self.provider.release(self.desc.handle)?;
        Ok(())
    }
}

impl Owner for Kernel {
    /// A kernel owns nothing but itself.
    fn release_all(&self) -> Result<()> {
        self.release()
    }

    fn snapshot(&self) -> String {
        format!(
            "Kernel {{ name: {:?}, args: {}, released: {} }}",
            self.desc.function_name,
            self.num_args(),
            self.released.get()
        )
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_ending_in_cl_are_uris() {
        assert_eq!(ProgramSource::from("kernels/rng.cl"), ProgramSource::Uri("kernels/rng.cl".into()));
        assert!(matches!(ProgramSource::from("__kernel void k() {}"), ProgramSource::Source(_)));
        assert!(matches!(ProgramSource::from(String::from("a.cl")), ProgramSource::Uri(_)));
    }

    #[test]
    fn defines_prefix_the_options() {
        let opts = BuildOptions::default()
            .opts("-cl-fast-relaxed-math")
            .define("WIDTH", 64)
            .define("BLOCK", "4");
        assert_eq!(opts.to_string(), "-DBLOCK=4 -DWIDTH=64 -cl-fast-relaxed-math");
        assert_eq!(BuildOptions::default().to_string(), "");
    }
}
