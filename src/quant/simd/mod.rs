//! Architecture-specific dot-product paths.
//!
//! Every function here agrees with its scalar counterpart in
//! [`super::scalar`] to within 1 f32 ULP per contracted element; the
//! integer block sums are computed exactly, only the cross-block float
//! accumulation order differs. Unsupported targets fall through to the
//! scalar reference.

#[cfg(target_arch = "aarch64")]
mod neon;
#[cfg(target_arch = "x86_64")]
mod x86;

use super::blocks::*;
use super::scalar;

#[cfg(target_arch = "x86_64")]
#[inline]
fn have_avx2() -> bool {
    std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
}

#[allow(unreachable_code)]
pub fn vec_dot_q4_0_q8_0(n: usize, x: &[BlockQ4_0], y: &[BlockQ8_0]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if have_avx2() {
        return unsafe { x86::vec_dot_q4_0_q8_0(n, x, y) };
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon::vec_dot_q4_0_q8_0(n, x, y) };
    }
    scalar::vec_dot_q4_0_q8_0(n, x, y)
}

pub fn vec_dot_q4_1_q8_1(n: usize, x: &[BlockQ4_1], y: &[BlockQ8_1]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if have_avx2() {
        return unsafe { x86::vec_dot_q4_1_q8_1(n, x, y) };
    }
    scalar::vec_dot_q4_1_q8_1(n, x, y)
}

#[allow(unreachable_code)]
pub fn vec_dot_q8_0_q8_0(n: usize, x: &[BlockQ8_0], y: &[BlockQ8_0]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if have_avx2() {
        return unsafe { x86::vec_dot_q8_0_q8_0(n, x, y) };
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon::vec_dot_q8_0_q8_0(n, x, y) };
    }
    scalar::vec_dot_q8_0_q8_0(n, x, y)
}

#[allow(unreachable_code)]
pub fn vec_dot_f32(x: &[f32], y: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if have_avx2() {
        return unsafe { x86::vec_dot_f32(x, y) };
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon::vec_dot_f32(x, y) };
    }
    scalar::vec_dot_f32(x, y)
}
