//! Wire types for the CXL.cache (Type-1) and CXL.mem (Type-2) channels.
//!
//! Enum discriminants are part of the wire contract and must match the
//! reference device's bit assignments, not just be internally consistent.

pub mod cache;
pub mod mem;
