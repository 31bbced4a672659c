//! Cache geometry and bias-table constants.
//!
//! These are `const`s rather than a parsed config file: the reference
//! hard-codes them too, and tests need them exposed with fixed defaults,
//! which a const module does directly.

/// Cache line size in bytes, identical on host and device.
pub const BLOCK_SIZE: u64 = 64;

/// Ways per set, identical on host and device.
pub const ASSOC: usize = 4;

/// Sets per cache, identical on host and device.
pub const NUM_SETS: usize = 8;

/// Start of the coherent memory window in host address space.
pub const CFMWS_BASE_ADDR: u64 = 0x4_9000_0000;

/// Granularity of a single bias-table entry.
pub const BIAS_ENTRY_SIZE: u64 = 0x800_0000; // 128 MiB

/// Number of bias-table entries populated at construction (`[HOST_BIAS, DEVICE_BIAS]`).
pub const BIAS_TABLE_SIZE: usize = 2;
