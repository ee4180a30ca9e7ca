//! Process-wide state: conversion and activation lookup tables plus the
//! NUMA topology, built once under a critical section the first time a
//! context is created and never freed.

use std::sync::{Mutex, OnceLock};

use half::f16;

/// Serializes context creation. The first caller through also pays for the
/// table builds below.
pub(crate) static CONTEXT_INIT_LOCK: Mutex<()> = Mutex::new(());

static FP16_TO_F32: OnceLock<Vec<f32>> = OnceLock::new();
static GELU_F16: OnceLock<Vec<f16>> = OnceLock::new();
static GELU_QUICK_F16: OnceLock<Vec<f16>> = OnceLock::new();
static SILU_F16: OnceLock<Vec<f16>> = OnceLock::new();
static EXP_F16: OnceLock<Vec<f16>> = OnceLock::new();
static NUMA: OnceLock<NumaTopology> = OnceLock::new();

const SQRT_2_OVER_PI: f32 = 0.797_884_56;
const GELU_COEF_A: f32 = 0.044715;
const GELU_QUICK_COEF: f32 = -1.702;

#[inline]
pub(crate) fn gelu_f32(x: f32) -> f32 {
    0.5 * x * (1.0 + ((SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh()))
}

#[inline]
pub(crate) fn gelu_quick_f32(x: f32) -> f32 {
    x * (1.0 / (1.0 + (GELU_QUICK_COEF * x).exp()))
}

#[inline]
pub(crate) fn silu_f32(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Runs the one-time global initialization. Called with
/// [`CONTEXT_INIT_LOCK`] held by [`Context::init`](crate::Context::init).
pub(crate) fn ensure_tables() {
    FP16_TO_F32.get_or_init(|| {
        (0..=u16::MAX).map(|bits| f16::from_bits(bits).to_f32()).collect()
    });
    GELU_F16.get_or_init(|| table_over_f16(gelu_f32));
    GELU_QUICK_F16.get_or_init(|| table_over_f16(gelu_quick_f32));
    SILU_F16.get_or_init(|| table_over_f16(silu_f32));
    EXP_F16.get_or_init(|| table_over_f16(f32::exp));
    let numa = NUMA.get_or_init(NumaTopology::detect);
    if numa.nodes.len() > 1 {
        crate::debug!(n_nodes = numa.nodes.len(), "numa topology detected");
    }
}

fn table_over_f16(f: impl Fn(f32) -> f32) -> Vec<f16> {
    (0..=u16::MAX)
        .map(|bits| f16::from_f32(f(f16::from_bits(bits).to_f32())))
        .collect()
}

#[inline]
pub(crate) fn fp16_to_f32(h: f16) -> f32 {
    match FP16_TO_F32.get() {
        Some(table) => table[h.to_bits() as usize],
        None => h.to_f32(),
    }
}

#[inline]
pub(crate) fn gelu_f16_lookup(h: f16) -> f16 {
    match GELU_F16.get() {
        Some(table) => table[h.to_bits() as usize],
        None => f16::from_f32(gelu_f32(h.to_f32())),
    }
}

#[inline]
pub(crate) fn gelu_quick_f16_lookup(h: f16) -> f16 {
    match GELU_QUICK_F16.get() {
        Some(table) => table[h.to_bits() as usize],
        None => f16::from_f32(gelu_quick_f32(h.to_f32())),
    }
}

#[inline]
pub(crate) fn silu_f16_lookup(h: f16) -> f16 {
    match SILU_F16.get() {
        Some(table) => table[h.to_bits() as usize],
        None => f16::from_f32(silu_f32(h.to_f32())),
    }
}

#[inline]
#[allow(dead_code)]
pub(crate) fn exp_f16_lookup(h: f16) -> f16 {
    match EXP_F16.get() {
        Some(table) => table[h.to_bits() as usize],
        None => f16::from_f32(h.to_f32().exp()),
    }
}

/// CPU sets per NUMA node, read from sysfs on Linux. Single-node (or
/// unknown) topologies disable worker pinning.
#[derive(Debug, Clone, Default)]
pub(crate) struct NumaTopology {
    pub nodes: Vec<Vec<usize>>,
}

impl NumaTopology {
    pub(crate) fn get() -> &'static NumaTopology {
        NUMA.get_or_init(NumaTopology::detect)
    }

    fn detect() -> Self {
        let mut nodes = Vec::new();
        let mut node = 0usize;
        loop {
            let path = format!("/sys/devices/system/node/node{node}/cpulist");
            let Ok(cpulist) = std::fs::read_to_string(&path) else { break };
            nodes.push(parse_cpulist(cpulist.trim()));
            node += 1;
        }
        NumaTopology { nodes }
    }
}

/// Parses the sysfs cpulist syntax, e.g. `0-3,8-11`.
fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_parsing() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,8-9"), vec![0, 1, 8, 9]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn activation_tables_cover_f16_domain() {
        ensure_tables();
        let x = f16::from_f32(1.0);
        let y = silu_f16_lookup(x).to_f32();
        assert!((y - 0.731_058_6).abs() < 1e-3);
        assert!((fp16_to_f32(f16::from_f32(2.5)) - 2.5).abs() < 1e-3);
    }
}
