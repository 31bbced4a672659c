/// Errors an engine call can return without aborting the process.
///
/// Invariant violations (a caller misusing the API, e.g. directly accessing
/// a host-biased line from the device side) are bugs, not runtime
/// conditions, and stay as `debug_assert!`/`panic!` rather than variants
/// here.
#[derive(Debug, thiserror::Error)]
pub enum CoherenceError {
    #[error("protocol error: peer responded {opcode} for request at 0x{address:x}")]
    Protocol { opcode: &'static str, address: u64 },

    #[error("transport error: memory backend {op} failed at 0x{address:x}")]
    Transport { op: &'static str, address: u64 },

    #[error("back-invalidate conflict at 0x{address:x}")]
    BiConflict { address: u64 },
}
