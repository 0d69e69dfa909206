//! Kernel argument normalization.
//!
//! Callers hand kernels loosely-typed [`ArgValue`]s; the provider wants a
//! strict [`KernelArg`]. [`normalize`] converts between the two in one fixed
//! order of checks instead of probing the provider with candidate encodings.

use crate::error::{ClError, Result};
use crate::memory::{Buffer, Image};
use crate::provider::RawHandle;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
}

impl ScalarType {
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 => 8,
        }
    }

    /// The kernel-language spelling, e.g. `uchar`.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            ScalarType::I8 => "char",
            ScalarType::U8 => "uchar",
            ScalarType::I16 => "short",
            ScalarType::U16 => "ushort",
            ScalarType::I32 => "int",
            ScalarType::U32 => "uint",
            ScalarType::I64 => "long",
            ScalarType::U64 => "ulong",
            ScalarType::F32 => "float",
        }
    }

    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" => ScalarType::I8,
            "uchar" => ScalarType::U8,
            "short" => ScalarType::I16,
            "ushort" => ScalarType::U16,
            "int" => ScalarType::I32,
            "uint" => ScalarType::U32,
            "long" => ScalarType::I64,
            "ulong" => ScalarType::U64,
            "float" => ScalarType::F32,
            _ => return None,
        })
    }
}

/// What a kernel parameter expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Scalar(ScalarType),
    /// A fixed-lane vector such as `int4`.
    Vector(ScalarType, u8),
    /// A buffer or image.
    Memory,
    /// A `__local` allocation sized by the host.
    LocalScratch,
}

impl ArgKind {
    /// Bytes a by-value argument of this kind occupies.
    #[must_use]
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            ArgKind::Scalar(ty) => Some(ty.width()),
            ArgKind::Vector(ty, lanes) => Some(ty.width() * lanes as usize),
            ArgKind::Memory | ArgKind::LocalScratch => None,
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Scalar(ty) => write!(f, "{}", ty.type_name()),
            ArgKind::Vector(ty, lanes) => write!(f, "{}{lanes}", ty.type_name()),
            ArgKind::Memory => write!(f, "memory object"),
            ArgKind::LocalScratch => write!(f, "local scratch size"),
        }
    }
}

/// A host-side typed array, passed by value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TypedArray {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TypedArray::I8(v) => bytemuck::cast_slice(v),
            TypedArray::U8(v) => v.as_slice(),
            TypedArray::I16(v) => bytemuck::cast_slice(v),
            TypedArray::U16(v) => bytemuck::cast_slice(v),
            TypedArray::I32(v) => bytemuck::cast_slice(v),
            TypedArray::U32(v) => bytemuck::cast_slice(v),
            TypedArray::F32(v) => bytemuck::cast_slice(v),
            TypedArray::F64(v) => bytemuck::cast_slice(v),
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            TypedArray::I8(_) => "Int8Array",
            TypedArray::U8(_) => "Uint8Array",
            TypedArray::I16(_) => "Int16Array",
            TypedArray::U16(_) => "Uint16Array",
            TypedArray::I32(_) => "Int32Array",
            TypedArray::U32(_) => "Uint32Array",
            TypedArray::F32(_) => "Float32Array",
            TypedArray::F64(_) => "Float64Array",
        }
    }
}

macro_rules! typed_array_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for TypedArray {
                fn from(v: Vec<$ty>) -> Self {
                    TypedArray::$variant(v)
                }
            }

            impl From<Vec<$ty>> for ArgValue {
                fn from(v: Vec<$ty>) -> Self {
                    ArgValue::Array(TypedArray::$variant(v))
                }
            }
        )*
    };
}

typed_array_from!(I8 => i8, U8 => u8, I16 => i16, U16 => u16, I32 => i32, U32 => u32, F32 => f32, F64 => f64);

/// A loosely-typed kernel argument as a caller supplies it.
#[derive(Clone)]
pub enum ArgValue {
    /// Name of a buffer or image in the kernel's context.
    Name(String),
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
    Number(f64),
    Array(TypedArray),
    Bool(bool),
    Null,
}

impl ArgValue {
    /// Describes the value's shape for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            ArgValue::Name(name) => format!("string '{name}'"),
            ArgValue::Buffer(_) => "Buffer".to_owned(),
            ArgValue::Image(_) => "Image".to_owned(),
            ArgValue::Number(n) if n.is_finite() && n.fract() == 0.0 => format!("integer {n}"),
            ArgValue::Number(n) => format!("number {n}"),
            ArgValue::Array(a) => format!("{}[{} bytes]", a.type_name(), a.as_bytes().len()),
            ArgValue::Bool(_) => "boolean".to_owned(),
            ArgValue::Null => "null".to_owned(),
        }
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<&str> for ArgValue {
    fn from(name: &str) -> Self {
        ArgValue::Name(name.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(name: String) -> Self {
        ArgValue::Name(name)
    }
}

impl From<Arc<Buffer>> for ArgValue {
    fn from(buffer: Arc<Buffer>) -> Self {
        ArgValue::Buffer(buffer)
    }
}

impl From<&Arc<Buffer>> for ArgValue {
    fn from(buffer: &Arc<Buffer>) -> Self {
        ArgValue::Buffer(Arc::clone(buffer))
    }
}

impl From<Arc<Image>> for ArgValue {
    fn from(image: Arc<Image>) -> Self {
        ArgValue::Image(image)
    }
}

impl From<&Arc<Image>> for ArgValue {
    fn from(image: &Arc<Image>) -> Self {
        ArgValue::Image(Arc::clone(image))
    }
}

impl From<f64> for ArgValue {
    fn from(n: f64) -> Self {
        ArgValue::Number(n)
    }
}

impl From<f32> for ArgValue {
    fn from(n: f32) -> Self {
        ArgValue::Number(f64::from(n))
    }
}

impl From<i32> for ArgValue {
    fn from(n: i32) -> Self {
        ArgValue::Number(f64::from(n))
    }
}

impl From<u32> for ArgValue {
    fn from(n: u32) -> Self {
        ArgValue::Number(f64::from(n))
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

/// A provider-ready kernel argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Memory(RawHandle),
    Bytes(Vec<u8>),
    Local(usize),
}

/// Name resolution for memory-object arguments.
pub trait MemoryResolver {
    fn resolve_buffer(&self, name: &str) -> Option<Arc<Buffer>>;
    fn resolve_image(&self, name: &str) -> Option<Arc<Image>>;
}

/// Converts `value` into the form a parameter of kind `expected` takes.
///
/// Checks run in a fixed order: names (buffers first, then images), direct
/// memory references, typed arrays of exactly the expected width, local
/// scratch sizes, plain numbers. Anything else is rejected; nothing is ever
/// truncated to fit.
pub fn normalize(
    expected: ArgKind,
    value: &ArgValue,
    resolver: &dyn MemoryResolver,
) -> Result<KernelArg> {
    match (expected, value) {
        (ArgKind::Memory, ArgValue::Name(name)) => {
            if let Some(buffer) = resolver.resolve_buffer(name) {
                return buffer.checked_handle().map(KernelArg::Memory);
            }
            if let Some(image) = resolver.resolve_image(name) {
                return image.checked_handle().map(KernelArg::Memory);
            }
            Err(ClError::UnresolvedName { kind: "Buffer or Image", name: name.clone() })
        }
        (ArgKind::Memory, ArgValue::Buffer(buffer)) => buffer.checked_handle().map(KernelArg::Memory),
        (ArgKind::Memory, ArgValue::Image(image)) => image.checked_handle().map(KernelArg::Memory),
        (_, ArgValue::Array(array)) if expected.byte_width() == Some(array.as_bytes().len()) => {
            Ok(KernelArg::Bytes(array.as_bytes().to_vec()))
        }
        (ArgKind::LocalScratch, ArgValue::Number(n)) => {
            scratch_size(*n).map(KernelArg::Local).ok_or_else(|| unsupported(expected, value))
        }
        (ArgKind::Scalar(ty), ArgValue::Number(n)) => {
            encode_number(ty, *n).map(KernelArg::Bytes).ok_or_else(|| unsupported(expected, value))
        }
        _ => Err(unsupported(expected, value)),
    }
}

fn unsupported(expected: ArgKind, value: &ArgValue) -> ClError {
    ClError::UnsupportedArgumentType {
        expected: expected.to_string(),
        received: value.describe(),
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scratch_size(n: f64) -> Option<usize> {
    (n.is_finite() && n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX)).then(|| n as usize)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_number(ty: ScalarType, n: f64) -> Option<Vec<u8>> {
    if !n.is_finite() {
        return None;
    }
    let integral = n.fract() == 0.0;
    let in_range = |lo: f64, hi: f64| n >= lo && n <= hi;
    match ty {
        ScalarType::F32 => encode_f32(n),
        _ if !integral => None,
        ScalarType::I8 => in_range(i8::MIN.into(), i8::MAX.into()).then(|| (n as i8).to_le_bytes().to_vec()),
        ScalarType::U8 => in_range(0.0, u8::MAX.into()).then(|| vec![n as u8]),
        ScalarType::I16 => in_range(i16::MIN.into(), i16::MAX.into()).then(|| (n as i16).to_le_bytes().to_vec()),
        ScalarType::U16 => in_range(0.0, u16::MAX.into()).then(|| (n as u16).to_le_bytes().to_vec()),
        ScalarType::I32 => in_range(i32::MIN.into(), i32::MAX.into()).then(|| (n as i32).to_le_bytes().to_vec()),
        ScalarType::U32 => in_range(0.0, u32::MAX.into()).then(|| (n as u32).to_le_bytes().to_vec()),
        ScalarType::I64 => (n >= -TWO_POW_63 && n < TWO_POW_63).then(|| split_halves(n as i64 as u64)),
        ScalarType::U64 => (n >= 0.0 && n < TWO_POW_64).then(|| split_halves(n as u64)),
    }
}

/// Integers must survive the narrowing exactly and non-zero values must not
/// flush to zero.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn encode_f32(n: f64) -> Option<Vec<u8>> {
    let v = n as f32;
    let exact = n.fract() != 0.0 || f64::from(v) == n;
    let kept = n == 0.0 || v != 0.0;
    (v.is_finite() && exact && kept).then(|| v.to_le_bytes().to_vec())
}

/// 64-bit values travel as two 32-bit words, high word first.
fn split_halves(v: u64) -> Vec<u8> {
    let hi = (v >> 32) as u32;
    let lo = (v & 0xffff_ffff) as u32;
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&hi.to_le_bytes());
    bytes.extend_from_slice(&lo.to_le_bytes());
    bytes
}
