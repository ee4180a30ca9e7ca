//! On-disk block layouts for the quantized formats.
//!
//! These structs are bit-exact with the GGUF contract: a tensor payload is
//! a packed array of blocks, each carrying its scale (and optionally a
//! minimum / high-bit sidecar) in half precision. Cross-tool compatibility
//! depends on the exact field order and widths, hence the size asserts.

use half::f16;

pub const QK_K: usize = 256;
pub const K_SCALE_SIZE: usize = 12;
pub const QK4_0: usize = 32;
pub const QK4_1: usize = 32;
pub const QK5_0: usize = 32;
pub const QK5_1: usize = 32;
pub const QK8_0: usize = 32;
pub const QK8_1: usize = 32;

/// 32 values, symmetric: `v = (nibble - 8) * d`.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ4_0 {
    pub d: f16,
    pub qs: [u8; QK4_0 / 2],
}
const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);

/// 32 values, min/max: `v = nibble * d + m`.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ4_1 {
    pub d: f16,
    pub m: f16,
    pub qs: [u8; QK4_1 / 2],
}
const _: () = assert!(std::mem::size_of::<BlockQ4_1>() == 20);

/// 32 values, symmetric 5-bit: bit `j` of `qh` is the 5th bit of quant `j`
/// for the first half, bit `j+16` for the second; `v = ((q | hi) - 16) * d`.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ5_0 {
    pub d: f16,
    pub qh: [u8; 4],
    pub qs: [u8; QK5_0 / 2],
}
const _: () = assert!(std::mem::size_of::<BlockQ5_0>() == 22);

/// 32 values, min/max 5-bit: `v = (q | hi) * d + m`.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ5_1 {
    pub d: f16,
    pub m: f16,
    pub qh: [u8; 4],
    pub qs: [u8; QK5_1 / 2],
}
const _: () = assert!(std::mem::size_of::<BlockQ5_1>() == 24);

/// 32 values, symmetric 8-bit: `v = q * d`.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ8_0 {
    pub d: f16,
    pub qs: [i8; QK8_0],
}
const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 34);

/// 32 values, symmetric 8-bit with the precomputed sum `s = d * Σq` that
/// asymmetric dot products use for their bias term. Full-precision scale.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ8_1 {
    pub d: f32,
    pub s: f32,
    pub qs: [i8; QK8_1],
}
const _: () = assert!(std::mem::size_of::<BlockQ8_1>() == 40);

/// 256 values: 2-bit quants in 16-element sub-blocks, 4-bit scale and min
/// per sub-block, super-block scale pair in half precision.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ2K {
    pub scales: [u8; QK_K / 16],
    pub qs: [u8; QK_K / 4],
    pub d: f16,
    pub dmin: f16,
}
const _: () = assert!(std::mem::size_of::<BlockQ2K>() == QK_K / 16 + QK_K / 4 + 2 * 2);

/// 256 values: 3-bit quants (2 low bits packed, high bit in `hmask`),
/// 6-bit sub-block scales packed into 12 bytes.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ3K {
    pub hmask: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 4],
    pub scales: [u8; K_SCALE_SIZE],
    pub d: f16,
}
const _: () = assert!(std::mem::size_of::<BlockQ3K>() == QK_K / 8 + QK_K / 4 + K_SCALE_SIZE + 2);

/// 256 values: 4-bit quants in 32-element sub-blocks, 6-bit scales and
/// mins packed into 12 bytes.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ4K {
    pub d: f16,
    pub dmin: f16,
    pub scales: [u8; K_SCALE_SIZE],
    pub qs: [u8; QK_K / 2],
}
const _: () = assert!(std::mem::size_of::<BlockQ4K>() == QK_K / 2 + K_SCALE_SIZE + 2 * 2);

/// 256 values: 5-bit quants (4 low bits packed, high bits in `qh`).
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ5K {
    pub d: f16,
    pub dmin: f16,
    pub scales: [u8; K_SCALE_SIZE],
    pub qh: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 2],
}
const _: () =
    assert!(std::mem::size_of::<BlockQ5K>() == QK_K / 8 + QK_K / 2 + 2 * 2 + K_SCALE_SIZE);

/// 256 values: 6-bit quants (4 low bits in `ql`, 2 high bits in `qh`),
/// signed 8-bit sub-block scales.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ6K {
    pub ql: [u8; QK_K / 2],
    pub qh: [u8; QK_K / 4],
    pub scales: [i8; QK_K / 16],
    pub d: f16,
}
const _: () = assert!(std::mem::size_of::<BlockQ6K>() == 3 * QK_K / 4 + QK_K / 16 + 2);

/// 256 values: full 8-bit quants with per-16 sums, the right-hand format
/// every K-quant dot product pairs with.
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct BlockQ8K {
    pub d: f32,
    pub qs: [i8; QK_K],
    pub bsums: [i16; QK_K / 16],
}
const _: () = assert!(std::mem::size_of::<BlockQ8K>() == 4 + QK_K + QK_K / 16 * 2);
