//! Element-wise copy and reduce primitives used by the ring kernel.
//!
//! The kernel works on raw byte pointers into staging buffers and user
//! buffers; these helpers dispatch on [`DataType`] to the typed loops.

use crate::types::{DataType, ReduceOp};

/// Types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, u8, i32, u32, i64, u64);
impl_reducible!(float: f32, f64);

// ── Half precision ─────────────────────────────────────────────────────
//
// Half types are combined in f32 and rounded back once per hop, which is
// what a device kernel without native half arithmetic does.

/// IEEE 754 binary16 stored as raw bits.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(transparent)]
pub(crate) struct F16(pub u16);

impl F16 {
    pub fn from_f32(v: f32) -> Self {
        let bits = v.to_bits();
        let sign = ((bits >> 16) & 0x8000) as u16;
        let exp = ((bits >> 23) & 0xFF) as i32;
        let man = bits & 0x007F_FFFF;

        if exp == 0xFF {
            let nan = if man != 0 { 0x0200 } else { 0 };
            return F16(sign | 0x7C00 | nan);
        }
        let e = exp - 127 + 15;
        if e >= 0x1F {
            return F16(sign | 0x7C00);
        }
        if e <= 0 {
            if e < -10 {
                return F16(sign);
            }
            // Subnormal: shift the implicit bit into the mantissa.
            let m = man | 0x0080_0000;
            let shift = (14 - e) as u32;
            let half = m >> shift;
            return F16(sign | round_half_even(half, m, shift) as u16);
        }
        let half = ((e as u32) << 10) | (man >> 13);
        // A carry out of the mantissa correctly bumps the exponent.
        F16(sign | round_half_even(half, man, 13) as u16)
    }

    pub fn to_f32(self) -> f32 {
        let h = self.0 as u32;
        let sign = (h & 0x8000) << 16;
        let exp = (h >> 10) & 0x1F;
        let man = h & 0x03FF;
        match exp {
            0 if man == 0 => f32::from_bits(sign),
            0 => {
                let v = man as f32 * f32::powi(2.0, -24);
                if sign != 0 { -v } else { v }
            }
            0x1F => f32::from_bits(sign | 0x7F80_0000 | (man << 13)),
            _ => f32::from_bits(sign | ((exp + 127 - 15) << 23) | (man << 13)),
        }
    }
}

/// `half` is `bits >> shift`; round it to nearest, ties to even.
fn round_half_even(half: u32, bits: u32, shift: u32) -> u32 {
    let guard = (bits >> (shift - 1)) & 1;
    let sticky = u32::from(bits & ((1 << (shift - 1)) - 1) != 0);
    half + (guard & (sticky | (half & 1)))
}

/// bfloat16 stored as raw bits.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(transparent)]
pub(crate) struct Bf16(pub u16);

impl Bf16 {
    pub fn from_f32(v: f32) -> Self {
        if v.is_nan() {
            return Bf16(0x7FC0);
        }
        let bits = v.to_bits();
        // Round to nearest, ties to even.
        let rounded = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
        Bf16((rounded >> 16) as u16)
    }

    pub fn to_f32(self) -> f32 {
        f32::from_bits((self.0 as u32) << 16)
    }
}

impl Reducible for F16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        F16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

impl Reducible for Bf16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        Bf16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

// ── Primitives ─────────────────────────────────────────────────────────

/// Copy `count` elements of `dtype` from `src` to `dst`.
///
/// # Safety
/// Both pointers must be valid for `count * dtype.size_in_bytes()` bytes and
/// the ranges must not overlap.
pub(crate) unsafe fn copy_elems(dst: *mut u8, src: *const u8, count: usize, dtype: DataType) {
    unsafe { std::ptr::copy_nonoverlapping(src, dst, count * dtype.size_in_bytes()) };
}

/// `dst[i] = op(acc[i], local[i])` for `count` elements of `dtype`.
///
/// The accumulated value is always the left operand, so the combination
/// order follows the ring.
///
/// # Safety
/// All three pointers must be valid for `count * dtype.size_in_bytes()`
/// bytes; `dst` must not overlap `acc` or `local`.
pub(crate) unsafe fn reduce_elems(
    dst: *mut u8,
    acc: *const u8,
    local: *const u8,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) {
    unsafe {
        match dtype {
            DataType::I8 => reduce_typed::<i8>(dst, acc, local, count, op),
            DataType::U8 => reduce_typed::<u8>(dst, acc, local, count, op),
            DataType::I32 => reduce_typed::<i32>(dst, acc, local, count, op),
            DataType::U32 => reduce_typed::<u32>(dst, acc, local, count, op),
            DataType::F16 => reduce_typed::<F16>(dst, acc, local, count, op),
            DataType::BF16 => reduce_typed::<Bf16>(dst, acc, local, count, op),
            DataType::F32 => reduce_typed::<f32>(dst, acc, local, count, op),
            DataType::F64 => reduce_typed::<f64>(dst, acc, local, count, op),
            DataType::I64 => reduce_typed::<i64>(dst, acc, local, count, op),
            DataType::U64 => reduce_typed::<u64>(dst, acc, local, count, op),
        }
    }
}

/// # Safety
/// See [`reduce_elems`]. Pointers need not be aligned for `T`.
unsafe fn reduce_typed<T: Reducible>(
    dst: *mut u8,
    acc: *const u8,
    local: *const u8,
    count: usize,
    op: ReduceOp,
) {
    let dst = dst.cast::<T>();
    let acc = acc.cast::<T>();
    let local = local.cast::<T>();
    for i in 0..count {
        unsafe {
            let a = acc.add(i).read_unaligned();
            let b = local.add(i).read_unaligned();
            dst.add(i).write_unaligned(T::reduce(a, b, op));
        }
    }
}
