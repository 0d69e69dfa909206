//! Sessions: device discovery and the contexts created on top of it.

use crate::context::Context;
use crate::dispatch::{CleanupDispatcher, Owner, Policy};
use crate::error::{ClError, Result};
use crate::provider::{split_extensions, ComputeProvider, DeviceDesc, DeviceType, PlatformDesc, RawHandle};
use crate::registry::{NamedRegistry, Warnings};
use crate::resource::Named;
use crate::source::{FileSourceLoader, SourceLoader};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SESSION_OPS: &[&str] = &["create_context"];

static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(0);

/// Behaviour switches shared by everything a session creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Log operation, arguments and owner state when a wrapped call fails.
    pub debug: bool,
    /// Release everything the owner holds when a wrapped call fails.
    pub cleanup: bool,
    /// Create command queues with profiling enabled.
    pub profile: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { debug: false, cleanup: true, profile: true }
    }
}

impl SessionConfig {
    /// Defaults overridden by `CLKIT_DEBUG`, `CLKIT_CLEANUP` and `CLKIT_PROFILE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| match lookup(key).as_deref().map(str::trim) {
            None | Some("") => default,
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                tracing::warn!("ignoring {key}={other:?}, expected a boolean");
                default
            }
        };
        Self {
            debug: flag("CLKIT_DEBUG", defaults.debug),
            cleanup: flag("CLKIT_CLEANUP", defaults.cleanup),
            profile: flag("CLKIT_PROFILE", defaults.profile),
        }
    }

    #[must_use]
    pub fn policy(&self) -> Policy {
        Policy { cleanup: self.cleanup, debug: self.debug }
    }
}

/// A compute device usable for contexts: available and with a compiler.
#[derive(Debug)]
pub struct Device {
    id: String,
    desc: DeviceDesc,
    platform_vendor: String,
}

impl Device {
    /// Per-session identifier such as `CPU0` or `GPU1`.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.desc.handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.desc.vendor
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.desc.version
    }

    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.desc.device_type
    }

    #[must_use]
    pub fn available(&self) -> bool {
        self.desc.available && self.desc.compiler_available
    }

    /// Vendor of the platform the device belongs to; build failures are
    /// reported under this name.
    #[must_use]
    pub fn platform_vendor(&self) -> &str {
        &self.platform_vendor
    }

    #[must_use]
    pub fn supported_extensions(&self) -> Vec<String> {
        split_extensions(&self.desc.extensions)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.desc.name, self.desc.version)
    }
}

#[derive(Debug)]
pub struct Platform {
    desc: PlatformDesc,
    devices: Vec<Arc<Device>>,
}

impl Platform {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.desc.vendor
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.desc.version
    }

    /// Usable devices only.
    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub fn supported_extensions(&self) -> Vec<String> {
        split_extensions(&self.desc.extensions)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub name: Option<String>,
    /// Defaults to the session's first device.
    pub device: Option<Arc<Device>>,
}

impl ContextOptions {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn device(mut self, device: &Arc<Device>) -> Self {
        self.device = Some(Arc::clone(device));
        self
    }
}

/// Entry point: owns the discovered devices and every context created on
/// them. Sessions share nothing with each other.
pub struct Session {
    id: usize,
    config: SessionConfig,
    provider: Arc<dyn ComputeProvider>,
    loader: Arc<dyn SourceLoader>,
    platforms: Vec<Platform>,
    devices: Vec<Arc<Device>>,
    contexts: NamedRegistry<Context>,
    warnings: Warnings,
    dispatcher: CleanupDispatcher,
}

impl Session {
    /// A session loading kernel sources from the working directory.
    pub fn new(provider: Arc<dyn ComputeProvider>, config: SessionConfig) -> Result<Self> {
        Self::with_loader(provider, Arc::new(FileSourceLoader::default()), config)
    }

    pub fn with_loader(
        provider: Arc<dyn ComputeProvider>,
        loader: Arc<dyn SourceLoader>,
        config: SessionConfig,
    ) -> Result<Self> {
        let platforms = discover(provider.platforms()?);
        let devices: Vec<Arc<Device>> = platforms.iter().flat_map(|p| p.devices.iter().cloned()).collect();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            session = id,
            platforms = platforms.len(),
            devices = devices.len(),
            "session started"
        );
        Ok(Self {
            id,
            config,
            provider,
            loader,
            platforms,
            devices,
            contexts: NamedRegistry::new(),
            warnings: Warnings::default(),
            dispatcher: CleanupDispatcher::new("Session", SESSION_OPS, config.policy()),
        })
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.provider
    }

    #[must_use]
    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Looks a device up by its id, e.g. `GPU0`.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.iter().find(|d| d.id == id).cloned()
    }

    pub fn create_context(&self, options: ContextOptions) -> Result<Arc<Context>> {
        self.dispatcher.run(self, "create_context", &options, || {
            let device = match options.device.clone() {
                Some(device) => device,
                None => self.devices.first().cloned().ok_or_else(no_device)?,
            };
            let ours = self.devices.iter().any(|d| Arc::ptr_eq(d, &device));
            if !ours || !device.available() {
                return Err(no_device());
            }
            let name = options.name.clone().unwrap_or_else(|| self.contexts.next_name());
            let handle = self.provider.create_context(&[device.handle()])?;
            let context = Context::new(
                name,
                handle,
                device,
                Arc::clone(&self.provider),
                Arc::clone(&self.loader),
                self.config,
            );
            self.warnings.push(self.contexts.insert(Arc::clone(&context)));
            tracing::info!(session = self.id, context = %context.name(), device = %context.device(), "context created");
            Ok(context)
        })
    }

    #[must_use]
    pub fn get_context(&self, name: &str) -> Option<Arc<Context>> {
        self.contexts.lookup(name)
    }

    #[must_use]
    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.contexts.entries()
    }

    /// Drains the failures to release entries that same-named ones replaced,
    /// oldest first.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<ClError> {
        self.warnings.take()
    }

    /// Releases and drops the context called `name`.
    pub fn release_context(&self, name: &str) -> Option<ClError> {
        self.contexts.remove(name)
    }

    /// Releases every context and everything they own.
    pub fn release_all(&self) -> Result<()> {
        self.contexts.release_all()
    }
}

impl Owner for Session {
    fn release_all(&self) -> Result<()> {
        Session::release_all(self)
    }

    fn snapshot(&self) -> String {
        format!(
            "Session {{ id: {}, devices: {}, contexts: {:?} }}",
            self.id,
            self.devices.len(),
            self.contexts.names()
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot())
    }
}

fn no_device() -> ClError {
    ClError::expecting("a valid and available Device")
}

/// Keeps usable devices and numbers them per type, across platforms.
fn discover(descs: Vec<PlatformDesc>) -> Vec<Platform> {
    let mut counters: HashMap<DeviceType, usize> = HashMap::new();
    descs
        .into_iter()
        .map(|mut desc| {
            let devices = std::mem::take(&mut desc.devices)
                .into_iter()
                .filter(|d| {
                    let usable = d.available && d.compiler_available;
                    if !usable {
                        tracing::debug!(device = %d.name, "skipping unavailable device");
                    }
                    usable
                })
                .map(|d| {
                    let n = counters.entry(d.device_type).or_insert(0);
                    let id = format!("{}{n}", d.device_type);
                    *n += 1;
                    Arc::new(Device { id, desc: d, platform_vendor: desc.vendor.clone() })
                })
                .collect();
            Platform { desc, devices }
        })
        .collect()
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    fn session() -> Session {
        Session::new(Arc::new(MockProvider::new()), SessionConfig::default()).unwrap()
    }

    #[test]
    fn discovery_keeps_usable_devices_with_typed_ids() {
        let session = session();
        let ids: Vec<&str> = session.devices().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["CPU0", "GPU0"]);
        assert_eq!(session.platforms()[0].devices().len(), 2);
        assert_eq!(session.device("GPU0").unwrap().name(), "Mock GPU");
        assert!(session.device("GPU1").is_none());
        assert_eq!(
            session.devices()[0].supported_extensions(),
            vec![
                "cl_khr_fp64".to_owned(),
                "cl_khr_global_int32_base_atomics".to_owned(),
                "cl_khr_byte_addressable_store".to_owned(),
            ]
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(session().id(), session().id());
    }

    #[test]
    fn context_defaults_to_first_device_and_auto_name() {
        let session = session();
        let ctx = session.create_context(ContextOptions::default()).unwrap();
        assert_eq!(ctx.name(), "0");
        assert_eq!(ctx.device().id(), "CPU0");
        assert!(Arc::ptr_eq(&session.get_context("0").unwrap(), &ctx));
    }

    #[test]
    fn foreign_device_is_rejected() {
        let a = session();
        let b = session();
        let foreign = b.device("GPU0").unwrap();
        let err = a.create_context(ContextOptions::default().device(&foreign)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Session.create_context: Invalid Arguments: Expecting a valid and available Device."
        );
    }

    #[test]
    fn config_reads_boolean_overrides() {
        let env: HashMap<&str, &str> =
            [("CLKIT_DEBUG", "1"), ("CLKIT_CLEANUP", "off"), ("CLKIT_PROFILE", "maybe")].into();
        let config = SessionConfig::from_lookup(|k| env.get(k).map(|v| (*v).to_owned()));
        assert_eq!(config, SessionConfig { debug: true, cleanup: false, profile: true });
        assert_eq!(config.policy(), Policy { cleanup: false, debug: true });
    }
}
