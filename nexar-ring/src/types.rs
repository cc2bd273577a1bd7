/// Rank of a participant in a communicator (0-indexed, user-visible order).
pub type Rank = u32;

/// Ordinal of a physical device as enumerated by the device adapter.
pub type DeviceOrdinal = usize;

/// Identifier of an OS process owning one or more devices.
pub type ProcessId = u32;

/// Maximum number of rings a communicator holds simultaneously.
pub const MAX_RINGS: usize = 8;

/// Default staging-buffer size per ring, in bytes.
pub const DEFAULT_BUFFER_SIZE_BYTES: usize = 1 << 25;

/// Alignment of transport regions and their staging buffers.
pub const MEM_PAD_ALIGN: usize = 4096;

/// Independent, fully pipelined reduction units per chunk.
pub const NUM_SUBCHUNKS: usize = 2;

/// Chunk slots in each staging buffer (double buffering).
pub const NUM_BUFCHUNKS: usize = 2;

/// Elements handled per producer per unrolled iteration.
pub const UNROLL: usize = 4;

/// Element types supported by the reduce-scatter kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    I8 = 0,
    U8 = 1,
    I32 = 2,
    U32 = 3,
    F16 = 4,
    BF16 = 5,
    F32 = 6,
    F64 = 7,
    I64 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::U32 => "u32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I64 => "i64",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for the reduce-scatter collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Native element types accepted by the typed collective entry points.
///
/// Sealed: the kernel only knows how to combine the types listed in
/// [`DataType`].
pub trait Element: Copy + Send + Sync + private::Sealed + 'static {
    const DTYPE: DataType;
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),*) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    i8 => I8,
    u8 => U8,
    i32 => I32,
    u32 => U32,
    f32 => F32,
    f64 => F64,
    i64 => I64,
    u64 => U64
);

/// View a typed slice as raw bytes.
pub(crate) fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: every `Element` is a plain numeric type without padding.
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast(), std::mem::size_of_val(data)) }
}

/// View a typed mutable slice as raw bytes.
pub(crate) fn as_bytes_mut<T: Element>(data: &mut [T]) -> &mut [u8] {
    // SAFETY: every bit pattern is valid for the numeric `Element` types.
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr().cast(), std::mem::size_of_val(data))
    }
}
