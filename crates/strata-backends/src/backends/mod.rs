//! Backend implementations

pub mod cpu;

pub use cpu::{CpuBackend, CpuBackendConfig, CpuBackendStats};
