// ============================================
// FFU Builder - lib.rs
// ============================================
// Builds flashable Windows FFU images.
//
// The pipeline provisions a virtual disk, lays out GPT partitions, applies
// a WIM/ESD (optionally from a mounted ISO), makes it bootable, captures
// it as an FFU, injects drivers, and optimizes the result. Each OS tool the
// pipeline drives sits behind a capability trait so the whole flow can run
// against in-memory fakes.
// ============================================

pub mod capture;
pub mod cleanup;
pub mod config;
pub mod deploy;
pub mod disk;
pub mod dism;
pub mod error;
pub mod hypervisor;
pub mod media;
pub mod partition;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod services;
pub mod volume;

#[cfg(test)]
mod testing;

pub use config::{BuildConfig, BuildContext, Timings};
pub use error::BuildError;
pub use pipeline::{BuildOutcome, Toolchain};
