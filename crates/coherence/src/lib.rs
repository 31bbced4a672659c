//! Core coherence engines for a CXL Type-1 (cache-participating) and a
//! Type-2 (bias-aware, memory-owning) device, modeled against the host and
//! device coherence objects of a CXL emulator rather than its wire timing.

pub mod bias;
pub mod cache;
pub mod config;
pub mod error;
pub mod membackend;
pub mod snoop_filter;
pub mod type1;
pub mod type2;

pub use error::CoherenceError;
pub use membackend::MemoryBackend;
pub use type1::Type1Engine;
pub use type2::Type2Engine;
