//! Core value types shared by the scheduler and the storage layer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of device a tensor or stream lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DeviceType {
    /// Host CPU.
    #[default]
    Cpu,
    /// NVIDIA GPU.
    Cuda,
    /// Apple GPU.
    Metal,
    /// WebGPU device.
    Wgpu,
}

impl DeviceType {
    /// All device kinds.
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Cpu,
        DeviceType::Cuda,
        DeviceType::Metal,
        DeviceType::Wgpu,
    ];

    /// Short tag used to build instruction names.
    pub fn tag(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Metal => "metal",
            DeviceType::Wgpu => "wgpu",
        }
    }

    /// Whether this is a non-host accelerator.
    #[inline]
    pub fn is_accelerator(self) -> bool {
        self != DeviceType::Cpu
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// Boolean stored as one byte.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE half precision.
    Float16,
    /// Brain floating point.
    BFloat16,
    /// IEEE single precision.
    #[default]
    Float32,
    /// IEEE double precision.
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }
}

/// Tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape from its dimensions.
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Scalar shape (no dimensions, one element).
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// Dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of elements.
    pub fn elem_cnt(&self) -> usize {
        self.0.iter().product()
    }

    /// Number of elements, or `None` if it does not fit in `usize`.
    pub fn checked_elem_cnt(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

/// Memory placement of a tensor body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryCase {
    /// Device kind.
    pub device_type: DeviceType,
    /// Device ordinal.
    pub device_id: u32,
}

impl MemoryCase {
    /// Host memory placement.
    pub fn host() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        }
    }

    /// Device memory placement.
    pub fn device(device_type: DeviceType, device_id: u32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    /// Whether the body lives in host memory.
    pub fn is_host(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }
}

impl fmt::Display for MemoryCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.device_id)
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value.
            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a register/storage object as seen by the scheduler.
    ObjectId,
    "obj"
);
define_id!(
    /// Identity of an instruction chain.
    ChainId,
    "chain"
);
define_id!(
    /// Identity of a chain package.
    PackageId,
    "pkg"
);
define_id!(
    /// Identity of a registered stream.
    StreamId,
    "stream"
);
define_id!(
    /// Identity of an actor on the message bus.
    ActorId,
    "actor"
);
define_id!(
    /// Identity of a register descriptor, shared by every register a
    /// producer emits for one output.
    RegisterDescId,
    "regst"
);

/// Monotonic id generator.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at zero.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Next raw id.
    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

static OBJECT_IDS: IdGenerator = IdGenerator::new();

impl ObjectId {
    /// Allocate a process-unique object id.
    pub fn generate() -> Self {
        ObjectId(OBJECT_IDS.next_raw())
    }
}
