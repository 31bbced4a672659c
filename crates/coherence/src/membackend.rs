//! Byte-addressed device-memory backend adapter (C7).
//!
//! The DCOH writes evicted lines and reads filled lines through this single
//! interface; the Type-1 HCOH->DCOH write-back path also uses it, routed
//! through the device's (out of scope) HPA->DPA address translation.

use crate::error::CoherenceError;

pub trait MemoryBackend {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, CoherenceError>;
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), CoherenceError>;
}

/// A flat `Vec<u8>`-backed memory region, standing in for the host-memory
/// backend object the reference wires up through QEMU's `AddressSpace`.
pub struct VecMemory {
    bytes: Vec<u8>,
}

impl VecMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }
}

impl MemoryBackend for VecMemory {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, CoherenceError> {
        let start = addr as usize;
        self.bytes
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or(CoherenceError::Transport { op: "read", address: addr })
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), CoherenceError> {
        let start = addr as usize;
        let dst = self
            .bytes
            .get_mut(start..start + bytes.len())
            .ok_or(CoherenceError::Transport { op: "write", address: addr })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut mem = VecMemory::new(128);
        mem.write(16, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read(16, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_access_is_a_transport_error() {
        let mem = VecMemory::new(8);
        assert!(mem.read(4, 16).is_err());
    }
}
