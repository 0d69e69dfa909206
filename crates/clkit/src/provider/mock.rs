//! In-memory [`ComputeProvider`] for tests and dry runs.
//!
//! Buffers keep real bytes so transfers round-trip. Programs are "compiled"
//! by scanning `__kernel` signatures out of the source text; kernels never
//! execute. Status codes follow the usual OpenCL numbering.

use crate::args::{ArgKind, KernelArg, ScalarType};
use crate::error::ProviderError;
use crate::provider::{
    BuildStatus, ComputeProvider, DeviceDesc, DeviceType, ImageFormat, KernelDesc, MemFlags,
    PlatformDesc, RawHandle,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

const OUT_OF_RESOURCES: i32 = -5;
const BUILD_PROGRAM_FAILURE: i32 = -11;
const INVALID_VALUE: i32 = -30;
const INVALID_DEVICE: i32 = -33;
const INVALID_CONTEXT: i32 = -34;
const INVALID_COMMAND_QUEUE: i32 = -36;
const INVALID_MEM_OBJECT: i32 = -38;
const INVALID_IMAGE_SIZE: i32 = -40;
const INVALID_BINARY: i32 = -42;
const INVALID_PROGRAM: i32 = -44;
const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
const INVALID_KERNEL: i32 = -48;
const INVALID_ARG_INDEX: i32 = -49;
const INVALID_ARG_VALUE: i32 = -50;
const INVALID_ARG_SIZE: i32 = -51;
const INVALID_KERNEL_ARGS: i32 = -52;
const INVALID_WORK_DIMENSION: i32 = -53;
const INVALID_WORK_GROUP_SIZE: i32 = -54;
const INVALID_EVENT: i32 = -58;
const INVALID_BUFFER_SIZE: i32 = -61;

const WORK_GROUP_SIZE: usize = 256;

enum Object {
    Context { devices: Vec<RawHandle> },
    Buffer { context: RawHandle, data: Vec<u8> },
    Image,
    Program { context: RawHandle, source: String, build: Option<Build> },
    Kernel { desc: KernelDesc, args: Vec<Option<KernelArg>> },
    Queue { context: RawHandle },
    Event,
}

struct Build {
    device: RawHandle,
    status: BuildStatus,
    log: String,
    kernels: Vec<(String, Vec<ArgKind>)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<RawHandle, Object>,
    next_handle: u64,
    fail_on: HashSet<&'static str>,
    dispatches: usize,
}

impl State {
    fn reserve(&mut self) -> RawHandle {
        let handle = RawHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn alloc(&mut self, object: Object) -> RawHandle {
        let handle = self.reserve();
        self.objects.insert(handle, object);
        handle
    }

    fn injected(&mut self, operation: &'static str) -> Result<(), ProviderError> {
        if self.fail_on.remove(operation) {
            return Err(ProviderError::new(
                OUT_OF_RESOURCES,
                format!("OUT_OF_RESOURCES (injected in {operation})"),
            ));
        }
        Ok(())
    }

    fn context_devices(&self, context: RawHandle) -> Result<&[RawHandle], ProviderError> {
        match self.objects.get(&context) {
            Some(Object::Context { devices }) => Ok(devices),
            _ => Err(invalid(INVALID_CONTEXT, "INVALID_CONTEXT", context)),
        }
    }

    fn queue_context(&self, queue: RawHandle) -> Result<RawHandle, ProviderError> {
        match self.objects.get(&queue) {
            Some(Object::Queue { context }) => Ok(*context),
            _ => Err(invalid(INVALID_COMMAND_QUEUE, "INVALID_COMMAND_QUEUE", queue)),
        }
    }

    fn buffer_mut(&mut self, buffer: RawHandle, context: RawHandle) -> Result<&mut Vec<u8>, ProviderError> {
        match self.objects.get_mut(&buffer) {
            Some(Object::Buffer { context: owner, data }) if *owner == context => Ok(data),
            Some(Object::Buffer { .. }) => Err(invalid(INVALID_CONTEXT, "INVALID_CONTEXT", buffer)),
            _ => Err(invalid(INVALID_MEM_OBJECT, "INVALID_MEM_OBJECT", buffer)),
        }
    }

    fn is_mem_object(&self, handle: RawHandle) -> bool {
        matches!(
            self.objects.get(&handle),
            Some(Object::Buffer { .. } | Object::Image)
        )
    }
}

fn invalid(code: i32, what: &str, handle: RawHandle) -> ProviderError {
    ProviderError::new(code, format!("{what} ({handle})"))
}

pub struct MockProvider {
    platforms: Vec<PlatformDesc>,
    state: Mutex<State>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// One platform with a CPU, a GPU and an unavailable second GPU.
    #[must_use]
    pub fn new() -> Self {
        let device = |id: u64, name: &str, device_type, available| DeviceDesc {
            handle: RawHandle(id),
            name: name.to_owned(),
            vendor: "clkit".to_owned(),
            version: "OpenCL 1.2 mock".to_owned(),
            device_type,
            available,
            compiler_available: true,
            extensions: "cl_khr_fp64 cl_khr_global_int32_base_atomics  cl_khr_byte_addressable_store "
                .to_owned(),
        };
        Self::with_platforms(vec![PlatformDesc {
            handle: RawHandle(1),
            name: "Mock Platform".to_owned(),
            vendor: "clkit".to_owned(),
            version: "OpenCL 1.2 mock".to_owned(),
            extensions: "cl_khr_icd cl_khr_fp64".to_owned(),
            devices: vec![
                device(2, "Mock CPU", DeviceType::Cpu, true),
                device(3, "Mock GPU", DeviceType::Gpu, true),
                device(4, "Offline GPU", DeviceType::Gpu, false),
            ],
        }])
    }

    #[must_use]
    pub fn with_platforms(platforms: Vec<PlatformDesc>) -> Self {
        Self {
            platforms,
            state: Mutex::new(State { next_handle: 1000, ..State::default() }),
        }
    }

    /// Makes the next call of `operation` fail with `OUT_OF_RESOURCES`.
    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().fail_on.insert(operation);
    }

    /// Number of objects created and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.state.lock().objects.contains_key(&handle)
    }

    /// The argument last set at `index` on `kernel`.
    pub fn kernel_arg(&self, kernel: RawHandle, index: usize) -> Option<KernelArg> {
        match self.state.lock().objects.get(&kernel) {
            Some(Object::Kernel { args, .. }) => args.get(index).cloned().flatten(),
            _ => None,
        }
    }

    /// Number of kernels enqueued so far.
    pub fn dispatch_count(&self) -> usize {
        self.state.lock().dispatches
    }

    fn device(&self, handle: RawHandle) -> Option<&DeviceDesc> {
        self.platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .find(|d| d.handle == handle)
    }

    fn create_program(&self, context: RawHandle, source: String) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.context_devices(context)?;
        Ok(state.alloc(Object::Program { context, source, build: None }))
    }
}

impl ComputeProvider for MockProvider {
    fn platforms(&self) -> Result<Vec<PlatformDesc>, ProviderError> {
        self.state.lock().injected("platforms")?;
        Ok(self.platforms.clone())
    }

    fn create_context(&self, devices: &[RawHandle]) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("create_context")?;
        if devices.is_empty() {
            return Err(ProviderError::new(INVALID_VALUE, "INVALID_VALUE (no devices)"));
        }
        for &handle in devices {
            if !self.device(handle).is_some_and(|d| d.available) {
                return Err(invalid(INVALID_DEVICE, "INVALID_DEVICE", handle));
            }
        }
        Ok(state.alloc(Object::Context { devices: devices.to_vec() }))
    }

    fn create_buffer(&self, context: RawHandle, _flags: MemFlags, size: usize) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("create_buffer")?;
        state.context_devices(context)?;
        if size == 0 {
            return Err(ProviderError::new(INVALID_BUFFER_SIZE, "INVALID_BUFFER_SIZE (0 bytes)"));
        }
        Ok(state.alloc(Object::Buffer { context, data: vec![0; size] }))
    }

    fn create_image(
        &self,
        context: RawHandle,
        _flags: MemFlags,
        _format: ImageFormat,
        width: usize,
        height: usize,
    ) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("create_image")?;
        state.context_devices(context)?;
        if width == 0 || height == 0 {
            return Err(ProviderError::new(
                INVALID_IMAGE_SIZE,
                format!("INVALID_IMAGE_SIZE ({width}x{height})"),
            ));
        }
        Ok(state.alloc(Object::Image))
    }

    fn create_program_with_source(&self, context: RawHandle, source: &str) -> Result<RawHandle, ProviderError> {
        self.state.lock().injected("create_program_with_source")?;
        if source.trim().is_empty() {
            return Err(ProviderError::new(INVALID_VALUE, "INVALID_VALUE (empty source)"));
        }
        self.create_program(context, source.to_owned())
    }

    fn create_program_with_binary(
        &self,
        context: RawHandle,
        device: RawHandle,
        binary: &[u8],
    ) -> Result<RawHandle, ProviderError> {
        {
            let mut state = self.state.lock();
            state.injected("create_program_with_binary")?;
            if !state.context_devices(context)?.contains(&device) {
                return Err(invalid(INVALID_DEVICE, "INVALID_DEVICE", device));
            }
        }
        let source = std::str::from_utf8(binary)
            .map_err(|_| ProviderError::new(INVALID_BINARY, "INVALID_BINARY"))?;
        self.create_program(context, source.to_owned())
    }

    fn build_program(&self, program: RawHandle, device: RawHandle, options: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.injected("build_program")?;
        let Some(Object::Program { context, source, .. }) = state.objects.get(&program) else {
            return Err(invalid(INVALID_PROGRAM, "INVALID_PROGRAM", program));
        };
        let context = *context;
        let outcome = check_directives(source, options).and_then(|()| scan_kernels(source));
        if !state.context_devices(context)?.contains(&device) {
            return Err(invalid(INVALID_DEVICE, "INVALID_DEVICE", device));
        }
        let (build, result) = match outcome {
            Ok(kernels) => (
                Build {
                    device,
                    status: BuildStatus::Success,
                    log: format!("build options: '{}'\n{} kernel(s) found", options.trim(), kernels.len()),
                    kernels,
                },
                Ok(()),
            ),
            Err(log) => (
                Build { device, status: BuildStatus::Error, log, kernels: Vec::new() },
                Err(ProviderError::new(BUILD_PROGRAM_FAILURE, "BUILD_PROGRAM_FAILURE")),
            ),
        };
        if let Some(Object::Program { build: slot, .. }) = state.objects.get_mut(&program) {
            *slot = Some(build);
        }
        result
    }

    fn build_status(&self, program: RawHandle, device: RawHandle) -> Result<BuildStatus, ProviderError> {
        match self.state.lock().objects.get(&program) {
            Some(Object::Program { build: Some(b), .. }) if b.device == device => Ok(b.status),
            Some(Object::Program { .. }) => Ok(BuildStatus::None),
            _ => Err(invalid(INVALID_PROGRAM, "INVALID_PROGRAM", program)),
        }
    }

    fn build_log(&self, program: RawHandle, device: RawHandle) -> Result<String, ProviderError> {
        match self.state.lock().objects.get(&program) {
            Some(Object::Program { build: Some(b), .. }) if b.device == device => Ok(b.log.clone()),
            Some(Object::Program { .. }) => Ok(String::new()),
            _ => Err(invalid(INVALID_PROGRAM, "INVALID_PROGRAM", program)),
        }
    }

    fn create_kernels(&self, program: RawHandle) -> Result<Vec<KernelDesc>, ProviderError> {
        let mut state = self.state.lock();
        state.injected("create_kernels")?;
        let signatures = match state.objects.get(&program) {
            Some(Object::Program { build: Some(b), .. }) if b.status == BuildStatus::Success => b.kernels.clone(),
            Some(Object::Program { .. }) => {
                return Err(invalid(INVALID_PROGRAM_EXECUTABLE, "INVALID_PROGRAM_EXECUTABLE", program))
            }
            _ => return Err(invalid(INVALID_PROGRAM, "INVALID_PROGRAM", program)),
        };
        let mut descs = Vec::with_capacity(signatures.len());
        for (function_name, args) in signatures {
            let desc = KernelDesc {
                handle: state.reserve(),
                function_name,
                args,
                work_group_size: WORK_GROUP_SIZE,
                local_mem_size: 0,
                private_mem_size: 0,
            };
            let slots = vec![None; desc.args.len()];
            state.objects.insert(desc.handle, Object::Kernel { desc: desc.clone(), args: slots });
            descs.push(desc);
        }
        Ok(descs)
    }

    fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        _profiling: bool,
    ) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("create_command_queue")?;
        if !state.context_devices(context)?.contains(&device) {
            return Err(invalid(INVALID_DEVICE, "INVALID_DEVICE", device));
        }
        Ok(state.alloc(Object::Queue { context }))
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: &KernelArg) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.injected("set_kernel_arg")?;
        let is_mem = match arg {
            KernelArg::Memory(h) => state.is_mem_object(*h),
            _ => false,
        };
        let Some(Object::Kernel { desc, args }) = state.objects.get_mut(&kernel) else {
            return Err(invalid(INVALID_KERNEL, "INVALID_KERNEL", kernel));
        };
        let index = index as usize;
        let Some(&kind) = desc.args.get(index) else {
            return Err(ProviderError::new(
                INVALID_ARG_INDEX,
                format!("INVALID_ARG_INDEX ({index} of {})", desc.args.len()),
            ));
        };
        match (kind, arg) {
            (ArgKind::Memory, KernelArg::Memory(h)) if !is_mem => {
                return Err(invalid(INVALID_MEM_OBJECT, "INVALID_MEM_OBJECT", *h));
            }
            (ArgKind::Memory, KernelArg::Memory(_)) => {}
            (ArgKind::LocalScratch, KernelArg::Local(0)) => {
                return Err(ProviderError::new(INVALID_ARG_SIZE, "INVALID_ARG_SIZE (0 bytes of local memory)"));
            }
            (ArgKind::LocalScratch, KernelArg::Local(_)) => {}
            (ArgKind::Scalar(_) | ArgKind::Vector(..), KernelArg::Bytes(bytes)) => {
                if kind.byte_width() != Some(bytes.len()) {
                    return Err(ProviderError::new(
                        INVALID_ARG_SIZE,
                        format!("INVALID_ARG_SIZE ({} bytes for {kind})", bytes.len()),
                    ));
                }
            }
            _ => {
                return Err(ProviderError::new(
                    INVALID_ARG_VALUE,
                    format!("INVALID_ARG_VALUE (argument {index} expects {kind})"),
                ));
            }
        }
        args[index] = Some(arg.clone());
        Ok(())
    }

    fn enqueue_write_buffer(&self, queue: RawHandle, buffer: RawHandle, src: &[u8]) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("enqueue_write_buffer")?;
        let context = state.queue_context(queue)?;
        let data = state.buffer_mut(buffer, context)?;
        if src.len() > data.len() {
            return Err(ProviderError::new(INVALID_VALUE, "INVALID_VALUE (write past end of buffer)"));
        }
        data[..src.len()].copy_from_slice(src);
        Ok(state.alloc(Object::Event))
    }

    fn enqueue_read_buffer(&self, queue: RawHandle, buffer: RawHandle, dst: &mut [u8]) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("enqueue_read_buffer")?;
        let context = state.queue_context(queue)?;
        let data = state.buffer_mut(buffer, context)?;
        if dst.len() > data.len() {
            return Err(ProviderError::new(INVALID_VALUE, "INVALID_VALUE (read past end of buffer)"));
        }
        dst.copy_from_slice(&data[..dst.len()]);
        Ok(state.alloc(Object::Event))
    }

    fn enqueue_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        global: &[usize],
        local: &[usize],
    ) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("enqueue_kernel")?;
        state.queue_context(queue)?;
        let Some(Object::Kernel { desc, args }) = state.objects.get(&kernel) else {
            return Err(invalid(INVALID_KERNEL, "INVALID_KERNEL", kernel));
        };
        if let Some(unset) = args.iter().position(Option::is_none) {
            return Err(ProviderError::new(
                INVALID_KERNEL_ARGS,
                format!("INVALID_KERNEL_ARGS (argument {unset} of {} not set)", desc.function_name),
            ));
        }
        if global.is_empty() || global.len() > 3 {
            return Err(ProviderError::new(
                INVALID_WORK_DIMENSION,
                format!("INVALID_WORK_DIMENSION ({})", global.len()),
            ));
        }
        if !local.is_empty() {
            let fits = local.len() == global.len()
                && local.iter().zip(global).all(|(&l, &g)| l > 0 && g % l == 0)
                && local.iter().product::<usize>() <= desc.work_group_size;
            if !fits {
                return Err(ProviderError::new(
                    INVALID_WORK_GROUP_SIZE,
                    format!("INVALID_WORK_GROUP_SIZE (global {global:?}, local {local:?})"),
                ));
            }
        }
        tracing::trace!(kernel = %desc.function_name, ?global, ?local, "mock dispatch");
        state.dispatches += 1;
        Ok(state.alloc(Object::Event))
    }

    fn enqueue_barrier(&self, queue: RawHandle, wait_list: &[RawHandle]) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.injected("enqueue_barrier")?;
        state.queue_context(queue)?;
        for &event in wait_list {
            if !matches!(state.objects.get(&event), Some(Object::Event)) {
                return Err(invalid(INVALID_EVENT, "INVALID_EVENT", event));
            }
        }
        Ok(())
    }

    fn enqueue_marker(&self, queue: RawHandle) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        state.injected("enqueue_marker")?;
        state.queue_context(queue)?;
        Ok(state.alloc(Object::Event))
    }

    fn finish(&self, queue: RawHandle) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.injected("finish")?;
        state.queue_context(queue).map(|_| ())
    }

    fn release(&self, handle: RawHandle) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.injected("release")?;
        state
            .objects
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| invalid(INVALID_VALUE, "INVALID_VALUE (unknown handle)", handle))
    }
}

const QUALIFIERS: &[&str] = &[
    "__global", "global", "__constant", "constant", "__private", "private", "const", "volatile",
    "restrict", "__restrict", "__read_only", "read_only", "__write_only", "write_only",
    "__read_write", "read_write",
];

/// Fails on an `#error` that survives `#ifdef`/`#ifndef` against the `-D`
/// names in `options`.
fn check_directives(source: &str, options: &str) -> Result<(), String> {
    let defined: HashSet<&str> = options
        .split_whitespace()
        .filter_map(|opt| opt.strip_prefix("-D"))
        .filter_map(|def| def.split('=').next())
        .collect();
    let mut active = vec![true];
    for line in source.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("#ifndef") {
            active.push(!defined.contains(name.trim()));
        } else if let Some(name) = line.strip_prefix("#ifdef") {
            active.push(defined.contains(name.trim()));
        } else if line.starts_with("#else") && active.len() > 1 {
            if let Some(top) = active.last_mut() {
                *top = !*top;
            }
        } else if line.starts_with("#endif") && active.len() > 1 {
            active.pop();
        } else if line.starts_with("#error") && active.iter().all(|a| *a) {
            return Err(format!("error: {line}"));
        }
    }
    Ok(())
}

/// Extracts `(function name, parameter kinds)` for every kernel in `source`.
///
/// On failure returns the build log.
fn scan_kernels(source: &str) -> Result<Vec<(String, Vec<ArgKind>)>, String> {
    let mut kernels = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("kernel void") {
        rest = &rest[pos + "kernel void".len()..];
        let open = rest.find('(').ok_or("error: expected '(' after kernel name")?;
        let name = rest[..open].trim().to_owned();
        let close = rest[open..].find(')').ok_or("error: unterminated parameter list")? + open;
        let mut args = Vec::new();
        for param in rest[open + 1..close].split(',').map(str::trim) {
            if param.is_empty() || param == "void" {
                continue;
            }
            args.push(param_kind(param).map_err(|e| format!("error: {e} in kernel '{name}'"))?);
        }
        kernels.push((name, args));
        rest = &rest[close..];
    }
    Ok(kernels)
}

fn param_kind(param: &str) -> Result<ArgKind, String> {
    let spaced = param.replace('*', " * ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    let is_local = tokens.iter().any(|t| *t == "__local" || *t == "local");
    if tokens.contains(&"*") {
        return Ok(if is_local { ArgKind::LocalScratch } else { ArgKind::Memory });
    }
    let mut types = tokens
        .iter()
        .copied()
        .filter(|t| !QUALIFIERS.contains(t) && *t != "__local" && *t != "local");
    let ty = match types.next() {
        Some("unsigned") => format!("u{}", types.next().unwrap_or("int")),
        Some(ty) => ty.to_owned(),
        None => return Err(format!("missing type in parameter '{param}'")),
    };
    if ty.starts_with("image") && ty.ends_with("_t") {
        return Ok(ArgKind::Memory);
    }
    if let Some(scalar) = ScalarType::from_type_name(&ty) {
        return Ok(ArgKind::Scalar(scalar));
    }
    let base = ty.trim_end_matches(|c: char| c.is_ascii_digit());
    let lanes = ty[base.len()..].parse::<u8>().ok();
    match (ScalarType::from_type_name(base), lanes) {
        (Some(scalar), Some(lanes @ (2 | 3 | 4 | 8 | 16))) => Ok(ArgKind::Vector(scalar, lanes)),
        _ => Err(format!("unknown type '{ty}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r"
        __kernel void rnd(__global uint* out, const unsigned int seed, __local float* scratch) {}
        kernel void scale(global float *data, float factor, int4 offset, read_only image2d_t img) {}
        __kernel void nothing(void) {}
    ";

    fn built(provider: &MockProvider, source: &str) -> (RawHandle, Result<(), ProviderError>) {
        let ctx = provider.create_context(&[RawHandle(2)]).unwrap();
        let program = provider.create_program_with_source(ctx, source).unwrap();
        let result = provider.build_program(program, RawHandle(2), "");
        (program, result)
    }

    #[test]
    fn scans_kernel_signatures() {
        let kernels = scan_kernels(SOURCE).unwrap();
        assert_eq!(kernels.len(), 3);
        assert_eq!(kernels[0].0, "rnd");
        assert_eq!(
            kernels[0].1,
            vec![ArgKind::Memory, ArgKind::Scalar(ScalarType::U32), ArgKind::LocalScratch]
        );
        assert_eq!(
            kernels[1].1,
            vec![
                ArgKind::Memory,
                ArgKind::Scalar(ScalarType::F32),
                ArgKind::Vector(ScalarType::I32, 4),
                ArgKind::Memory,
            ]
        );
        assert!(kernels[2].1.is_empty());
    }

    #[test]
    fn error_directives_respect_defines() {
        let source = "#ifndef WIDTH\n#error WIDTH must be defined\n#endif\n__kernel void k() {}";
        assert!(check_directives(source, "").unwrap_err().contains("WIDTH must be defined"));
        assert!(check_directives(source, "-DWIDTH=64 -Werror").is_ok());
        assert!(check_directives("#ifdef X\n#else\n#error no X\n#endif", "-DX=1 ").is_ok());
    }

    #[test]
    fn unknown_types_fail_the_build_with_a_log() {
        let provider = MockProvider::new();
        let (program, result) = built(&provider, "__kernel void k(double3x3 m) {}");
        assert_eq!(result.unwrap_err().code, BUILD_PROGRAM_FAILURE);
        assert_eq!(provider.build_status(program, RawHandle(2)).unwrap(), BuildStatus::Error);
        assert!(provider.build_log(program, RawHandle(2)).unwrap().contains("double3x3"));
        assert!(provider.create_kernels(program).is_err());
    }

    #[test]
    fn buffers_round_trip() {
        let provider = MockProvider::new();
        let ctx = provider.create_context(&[RawHandle(3)]).unwrap();
        let queue = provider.create_command_queue(ctx, RawHandle(3), true).unwrap();
        let buffer = provider.create_buffer(ctx, MemFlags::ReadWrite, 8).unwrap();
        provider.enqueue_write_buffer(queue, buffer, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        provider.enqueue_read_buffer(queue, buffer, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(provider.enqueue_write_buffer(queue, buffer, &[0; 9]).is_err());
    }

    #[test]
    fn kernel_args_are_checked_against_the_signature() {
        let provider = MockProvider::new();
        let (program, result) = built(&provider, SOURCE);
        result.unwrap();
        let kernels = provider.create_kernels(program).unwrap();
        let rnd = kernels[0].handle;

        let err = provider.set_kernel_arg(rnd, 0, &KernelArg::Memory(RawHandle(99_999))).unwrap_err();
        assert_eq!(err.code, INVALID_MEM_OBJECT);
        let err = provider.set_kernel_arg(rnd, 1, &KernelArg::Bytes(vec![0; 8])).unwrap_err();
        assert_eq!(err.code, INVALID_ARG_SIZE);
        let err = provider.set_kernel_arg(rnd, 3, &KernelArg::Local(16)).unwrap_err();
        assert_eq!(err.code, INVALID_ARG_INDEX);

        provider.set_kernel_arg(rnd, 1, &KernelArg::Bytes(vec![7, 0, 0, 0])).unwrap();
        assert_eq!(provider.kernel_arg(rnd, 1), Some(KernelArg::Bytes(vec![7, 0, 0, 0])));
    }

    #[test]
    fn enqueue_requires_every_argument() {
        let provider = MockProvider::new();
        let (program, result) = built(&provider, SOURCE);
        result.unwrap();
        let nothing = provider.create_kernels(program).unwrap()[2].handle;
        let ctx = provider.create_context(&[RawHandle(2)]).unwrap();
        let queue = provider.create_command_queue(ctx, RawHandle(2), false).unwrap();
        provider.enqueue_kernel(queue, nothing, &[64], &[]).unwrap();
        assert_eq!(provider.dispatch_count(), 1);
        let err = provider.enqueue_kernel(queue, nothing, &[64], &[48]).unwrap_err();
        assert_eq!(err.code, INVALID_WORK_GROUP_SIZE);
    }

    #[test]
    fn injected_failures_fire_once() {
        let provider = MockProvider::new();
        provider.fail_on("create_context");
        assert_eq!(provider.create_context(&[RawHandle(2)]).unwrap_err().code, OUT_OF_RESOURCES);
        assert!(provider.create_context(&[RawHandle(2)]).is_ok());
    }

    #[test]
    fn unavailable_devices_are_rejected() {
        let provider = MockProvider::new();
        assert_eq!(provider.create_context(&[RawHandle(4)]).unwrap_err().code, INVALID_DEVICE);
        let before = provider.live_handles();
        let ctx = provider.create_context(&[RawHandle(2)]).unwrap();
        assert!(provider.is_live(ctx));
        provider.release(ctx).unwrap();
        assert_eq!(provider.live_handles(), before);
        assert!(provider.release(ctx).is_err());
    }
}
