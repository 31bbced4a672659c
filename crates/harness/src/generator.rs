//! Background traffic generators.
//!
//! Each generator is a single thread that repeatedly picks a random
//! cache-line-aligned address and size within its assigned region and
//! issues a read or a write through the engine's public API, mirroring the
//! reference's `__ct2d_host_main`/`__ct2d_device_main` loops: boot delay,
//! then loop forever on (sleep, pick opcode, pick address, pick size,
//! access, assert success). The engines serialize concurrent access
//! themselves (`Mutex`), so no locking happens here beyond sharing the
//! `Arc`.

use std::sync::Arc;

use coherence::config::{BIAS_ENTRY_SIZE, BLOCK_SIZE, CFMWS_BASE_ADDR};
use coherence::membackend::VecMemory;
use coherence::{Type1Engine, Type2Engine};
use protocol::mem::MemCommand;
use rand::Rng;

use crate::constants::{self, GENERATOR_MAX_ACCESS_SIZE};

const HOST_COMMANDS: [MemCommand; 6] = [
    MemCommand::ReadMemInv,
    MemCommand::NdrMemInv,
    MemCommand::NdrMemShared,
    MemCommand::NdrHCacheInv,
    MemCommand::NdrSpecRd,
    MemCommand::NdrClnEvct,
];

fn aligned_address(rng: &mut impl Rng, base: u64, len: u64) -> u64 {
    let blocks = len / BLOCK_SIZE;
    base + rng.random_range(0..blocks) * BLOCK_SIZE
}

fn random_access_size(rng: &mut impl Rng) -> usize {
    rng.random_range(1..=GENERATOR_MAX_ACCESS_SIZE)
}

fn run_generator(name: &'static str, mut body: impl FnMut(&mut rand::rngs::ThreadRng)) {
    std::thread::sleep(constants::DEFAULT_BOOT_WAIT);
    let mut rng = rand::rng();
    let delay = constants::generator_delay();
    let mut count: u64 = 0;
    loop {
        std::thread::sleep(delay);
        body(&mut rng);
        count += 1;
        if count % 1000 == 0 {
            tracing::trace!(generator = name, count, "generator heartbeat");
        }
    }
}

/// Type-1 host-side generator: reads and writes at random addresses in the
/// shared backend, from the CPU side.
pub fn type1_host(engine: Arc<Type1Engine<VecMemory>>, backend_size: u64) {
    run_generator("type1-host", move |rng| {
        let addr = aligned_address(rng, 0, backend_size);
        let size = random_access_size(rng);
        if rng.random_bool(0.5) {
            engine.host_read(addr, size).expect("type1 host read failed");
        } else {
            let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            engine.host_write(addr, &data).expect("type1 host write failed");
        }
    });
}

/// Type-1 device-side generator: same address space, issued as
/// device-initiated accesses instead of CPU accesses.
pub fn type1_device(engine: Arc<Type1Engine<VecMemory>>, backend_size: u64) {
    run_generator("type1-device", move |rng| {
        let addr = aligned_address(rng, 0, backend_size);
        let size = random_access_size(rng);
        if rng.random_bool(0.5) {
            engine.device_read(addr, size).expect("type1 device read failed");
        } else {
            let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            engine.device_write(addr, &data).expect("type1 device write failed");
        }
    });
}

/// Type-2 host-side generator. Restricted to the device-biased entry, same
/// as the reference's host generator. Occasionally issues one of the six
/// fixed `host_command` probes instead of a plain read/write.
pub fn type2_host(engine: Arc<Type2Engine<VecMemory>>) {
    let base = CFMWS_BASE_ADDR + BIAS_ENTRY_SIZE;
    run_generator("type2-host", move |rng| {
        let addr = aligned_address(rng, base, BIAS_ENTRY_SIZE);
        if rng.random_ratio(1, 20) {
            let cmd = HOST_COMMANDS[rng.random_range(0..HOST_COMMANDS.len())];
            engine.host_command(cmd, addr).expect("type2 host_command probe failed");
            return;
        }
        let size = random_access_size(rng);
        if rng.random_bool(0.5) {
            engine.host_read(addr, size).expect("type2 host read failed");
        } else {
            let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            engine.host_write(addr, &data).expect("type2 host write failed");
        }
    });
}

/// Type-2 device-side generator, over the same device-biased region as the
/// host-side generator; host and device address the same CFMWS range
/// through different entry points.
pub fn type2_device(engine: Arc<Type2Engine<VecMemory>>) {
    let base = CFMWS_BASE_ADDR + BIAS_ENTRY_SIZE;
    run_generator("type2-device", move |rng| {
        let addr = aligned_address(rng, base, BIAS_ENTRY_SIZE);
        let size = random_access_size(rng);
        if rng.random_bool(0.5) {
            engine.device_read(addr, size).expect("type2 device read failed");
        } else {
            let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            engine.device_write(addr, &data).expect("type2 device write failed");
        }
    });
}
