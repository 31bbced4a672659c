//! Type-2 HCOH/DCOH pair: a device that owns its attached memory, with bias
//! tracking and Back-Invalidate for the host's opportunistic peeks.
//!
//! As in [`crate::type1`], host and device state live in one `Mutex`-guarded
//! struct so the two sides can call each other's tables without an ownership
//! cycle.

use crate::bias::BiasTable;
use crate::cache::{Cache, LineState};
use crate::config::{BLOCK_SIZE, CFMWS_BASE_ADDR};
use crate::error::CoherenceError;
use crate::membackend::MemoryBackend;
use crate::snoop_filter::SnoopFilter;
use protocol::mem::{
    BiRsp, BiSnpPacket, BiSnpReq, BiasState, M2SReq, MemCommand, MemReq, MetaField, MetaValue, S2MRsp, SnpType,
};
use std::sync::Mutex;
use tracing::trace;

const BLK: usize = BLOCK_SIZE as usize;

/// Translates a CFMWS-relative host/device address to the flat offset the
/// memory backend is indexed by. Stands in for the HPA->DPA step, a real
/// address decoder out of scope here.
fn backend_addr(addr: u64) -> u64 {
    addr - CFMWS_BASE_ADDR
}

struct Type2Inner<M> {
    host_cache: Cache,
    device_cache: Cache,
    bias: BiasTable,
    snoop_filter: SnoopFilter,
    memory: M,
}

pub struct Type2Engine<M> {
    inner: Mutex<Type2Inner<M>>,
}

impl<M: MemoryBackend> Type2Engine<M> {
    pub fn new(memory: M) -> Self {
        Self {
            inner: Mutex::new(Type2Inner {
                host_cache: Cache::new(),
                device_cache: Cache::new(),
                bias: BiasTable::new(),
                snoop_filter: SnoopFilter::new(),
                memory,
            }),
        }
    }

    /// Host-side CPU read, split across cache blocks if it straddles one.
    pub fn host_read(&self, haddr: u64, size: usize) -> Result<Vec<u8>, CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        split_host_access(&mut inner, haddr, size, None)
    }

    /// Host-side CPU write, split across cache blocks if it straddles one.
    pub fn host_write(&self, haddr: u64, data: &[u8]) -> Result<(), CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        split_host_access(&mut inner, haddr, data.len(), Some(data))?;
        Ok(())
    }

    /// One of the six fixed diagnostic M2S probes (§4.2.3's `host_command`).
    /// Only updates the host cache's line state when one already exists for
    /// this address; the probe never installs a new line.
    pub fn host_command(&self, cmd: MemCommand, haddr: u64) -> Result<S2MRsp, CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let (opcode, snp_type, meta_value) = cmd.request_shape();
        let block_addr = Cache::block_align(haddr);
        let req = MemReq::new(opcode, snp_type, MetaField::Meta0State, meta_value, block_addr);
        let (rsp, _) = dcoh_m2s(&mut inner, req, None)?;

        let tag = Cache::extract_tag(block_addr);
        let set = Cache::extract_set(block_addr);
        if let Some(way) = inner.host_cache.lookup(tag, set) {
            match opcode {
                // non-state-changing probe
                M2SReq::MemSpecRd => {}
                M2SReq::MemClnEvct => inner.host_cache.set_state(set, way, tag, LineState::Invalid),
                _ => {
                    let new_state = response_check_state(&req, rsp);
                    inner.host_cache.set_state(set, way, tag, new_state);
                }
            }
        }
        Ok(rsp)
    }

    /// Host-initiated M2S request delivered to the device (§4.3.4). `write_data`
    /// carries the block this request writes through to the backend, for
    /// opcodes that set the write-side of the table (victim write-back, plain
    /// device-biased stores); reads return their data alongside the response.
    pub fn device_access(
        &self,
        req: MemReq,
        write_data: Option<[u8; BLK]>,
    ) -> Result<(S2MRsp, Option<Vec<u8>>), CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let (rsp, data) = dcoh_m2s(&mut inner, req, write_data.as_ref())?;
        Ok((rsp, data.map(|b| b.to_vec())))
    }

    /// Device-initiated Back-Invalidate snoop delivered to the host (§4.2.4).
    pub fn device_response(&self, req: BiSnpPacket) -> Result<BiRsp, CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let (rsp, _) = host_bisnp(&mut inner.host_cache, &mut inner.memory, req.opcode, req.address)?;
        Ok(rsp)
    }

    /// Device-local CPU-like access, restricted to device-biased regions (§4.3.3).
    pub fn device_read(&self, daddr: u64, size: usize) -> Result<Vec<u8>, CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        device_local_access(&mut inner, daddr, size, None)
    }

    pub fn device_write(&self, daddr: u64, data: &[u8]) -> Result<(), CoherenceError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        device_local_access(&mut inner, daddr, data.len(), Some(data))?;
        Ok(())
    }
}

/// Splits a host access that straddles a cache block boundary into two
/// single-block calls, concatenating read results or slicing the write
/// payload across the split. Same shape as Type-1's `split_access`.
fn split_host_access<M: MemoryBackend>(
    inner: &mut Type2Inner<M>,
    addr: u64,
    size: usize,
    write_data: Option<&[u8]>,
) -> Result<Vec<u8>, CoherenceError> {
    let offset = Cache::extract_offset(addr);
    if offset + size as u64 <= BLOCK_SIZE {
        return host_access(inner, addr, size, write_data);
    }

    let low_len = (BLOCK_SIZE - offset) as usize;
    let high_len = size - low_len;
    let next_block = Cache::block_align(addr) + BLOCK_SIZE;

    match write_data {
        None => {
            let mut low = host_access(inner, addr, low_len, None)?;
            let high = host_access(inner, next_block, high_len, None)?;
            low.extend_from_slice(&high);
            Ok(low)
        }
        Some(data) => {
            host_access(inner, addr, low_len, Some(&data[..low_len]))?;
            host_access(inner, next_block, high_len, Some(&data[low_len..]))?;
            Ok(Vec::new())
        }
    }
}

/// Host CPU-like access (§4.2.3). The host cache holds lines from either
/// bias; bias only decides the M2S request shape issued on a miss, or on a
/// write hit against a Shared line the device still has a claim on.
fn host_access<M: MemoryBackend>(
    inner: &mut Type2Inner<M>,
    haddr: u64,
    size: usize,
    write_bytes: Option<&[u8]>,
) -> Result<Vec<u8>, CoherenceError> {
    let block_addr = Cache::block_align(haddr);
    let offset = Cache::extract_offset(haddr);
    debug_assert!(offset + size as u64 <= BLOCK_SIZE, "caller must split cross-block accesses");
    let tag = Cache::extract_tag(block_addr);
    let set = Cache::extract_set(block_addr);
    let write = write_bytes.is_some();

    if let Some(way) = inner.host_cache.lookup(tag, set) {
        if write && inner.bias.lookup(block_addr) == BiasState::DeviceBias {
            let cstate = inner.host_cache.state(set, way);
            debug_assert!(cstate.is_valid());
            if cstate == LineState::Shared {
                let req =
                    MemReq::new(M2SReq::MemInv, SnpType::SnpInv, MetaField::Meta0State, MetaValue::Any, block_addr);
                let (rsp, _) = dcoh_m2s(inner, req, None)?;
                if matches!(rsp, S2MRsp::CmpError) {
                    return Err(CoherenceError::Transport { op: "host_access-upgrade", address: block_addr });
                }
                debug_assert!(matches!(rsp, S2MRsp::CmpExclusive));
                inner.host_cache.set_state(set, way, tag, LineState::Exclusive);
            }
        }
        if let Some(bytes) = write_bytes {
            inner.host_cache.write(set, way, offset, bytes);
            Ok(Vec::new())
        } else {
            Ok(inner.host_cache.read(set, way, offset, size))
        }
    } else {
        let way = inner.host_cache.find_invalid(set).unwrap_or_else(|| inner.host_cache.find_victim(set));
        if let Some(victim_addr) = inner.host_cache.assemble_address(set, way) {
            let victim_block = *inner.host_cache.block(set, way);
            let req = if inner.bias.lookup(victim_addr) == BiasState::HostBias {
                MemReq::new(M2SReq::MemWr, SnpType::NoOp, MetaField::Meta0State, MetaValue::Any, victim_addr)
            } else {
                MemReq::new(M2SReq::MemWr, SnpType::SnpInv, MetaField::Meta0State, MetaValue::Invalid, victim_addr)
            };
            let (rsp, _) = dcoh_m2s(inner, req, Some(&victim_block))?;
            if matches!(rsp, S2MRsp::CmpError) {
                return Err(CoherenceError::Transport { op: "host_access-victim-writeback", address: victim_addr });
            }
            inner.host_cache.set_state(set, way, Cache::extract_tag(victim_addr), LineState::Invalid);
        }

        let bias_state = inner.bias.lookup(block_addr);
        let req = if bias_state == BiasState::HostBias {
            MemReq::new(M2SReq::MemRd, SnpType::NoOp, MetaField::Meta0State, MetaValue::Invalid, block_addr)
        } else if write {
            MemReq::new(M2SReq::MemRd, SnpType::SnpInv, MetaField::Meta0State, MetaValue::Any, block_addr)
        } else {
            MemReq::new(M2SReq::MemRd, SnpType::SnpData, MetaField::Meta0State, MetaValue::Shared, block_addr)
        };
        let (rsp, fwd) = dcoh_m2s(inner, req, None)?;
        if matches!(rsp, S2MRsp::CmpError) {
            return Err(CoherenceError::Transport { op: "host_access-fill", address: block_addr });
        }
        let new_state =
            if bias_state == BiasState::HostBias { LineState::Exclusive } else { response_check_state(&req, rsp) };
        let block = fwd.ok_or(CoherenceError::Protocol { opcode: "MemRd-fill-no-data", address: block_addr })?;
        inner.host_cache.set_block(set, way, block);
        inner.host_cache.set_state(set, way, tag, new_state);

        if let Some(bytes) = write_bytes {
            inner.host_cache.write(set, way, offset, bytes);
            Ok(Vec::new())
        } else {
            Ok(inner.host_cache.read(set, way, offset, size))
        }
    }
}

/// Type-2 DCOH M2S decision table (§4.3.4). Branches first on bias, then on
/// opcode/snoop-type/meta. Returns the S2M response and, for reads, the
/// block read (from the device cache if cached, else the memory backend).
/// `write_data`, when present, is the block-sized payload a `MemWr`-class
/// request writes straight through to the backend.
fn dcoh_m2s<M: MemoryBackend>(
    inner: &mut Type2Inner<M>,
    req: MemReq,
    write_data: Option<&[u8; BLK]>,
) -> Result<(S2MRsp, Option<[u8; BLK]>), CoherenceError> {
    let block_addr = Cache::block_align(req.address);
    let tag = Cache::extract_tag(block_addr);
    let set = Cache::extract_set(block_addr);
    let way = inner.device_cache.lookup(tag, set);
    let cache_cstate = way.map(|w| inner.device_cache.state(set, w)).unwrap_or(LineState::Invalid);

    let mut cache_nstate = LineState::Invalid;
    let mut cache_update = false;
    let mut data_read = false;
    let mut data_write = false;
    let mut data_flush = false;

    let rsp = match inner.bias.lookup(block_addr) {
        BiasState::HostBias => match req.opcode {
            M2SReq::MemRd | M2SReq::MemRdData => {
                data_read = true;
                cache_update = true;
                cache_nstate = shared_or_invalid(req.meta_value);
                S2MRsp::Cmp
            }
            M2SReq::MemInv | M2SReq::MemInvNT => {
                cache_update = true;
                cache_nstate = shared_or_invalid(req.meta_value);
                S2MRsp::Cmp
            }
            M2SReq::MemSpecRd => S2MRsp::Cmp,
            M2SReq::MemWr | M2SReq::MemWrPtl => {
                debug_assert_eq!(req.snp_type, SnpType::NoOp);
                data_write = true;
                cache_update = true;
                cache_nstate = shared_or_invalid(req.meta_value);
                S2MRsp::Cmp
            }
            M2SReq::BIConflict | M2SReq::MemRdFwd | M2SReq::MemWrFwd | M2SReq::MemClnEvct => S2MRsp::CmpError,
        },
        BiasState::DeviceBias => match req.opcode {
            M2SReq::MemRd => {
                data_read = true;
                cache_update = true;
                if req.meta_field == MetaField::NoOp {
                    match req.snp_type {
                        SnpType::SnpInv => data_flush = true,
                        SnpType::SnpCur => cache_update = false,
                        _ => return Err(CoherenceError::Protocol { opcode: "MemRd-NoOp", address: block_addr }),
                    }
                    S2MRsp::Cmp
                } else {
                    match req.meta_value {
                        MetaValue::Any => {
                            debug_assert_eq!(req.snp_type, SnpType::SnpInv);
                            S2MRsp::CmpExclusive
                        }
                        MetaValue::Shared => {
                            debug_assert_eq!(req.snp_type, SnpType::SnpData);
                            if cache_cstate == LineState::Invalid {
                                S2MRsp::CmpExclusive
                            } else {
                                cache_nstate = LineState::Shared;
                                S2MRsp::CmpShared
                            }
                        }
                        MetaValue::Invalid => {
                            match req.snp_type {
                                SnpType::SnpInv => data_flush = true,
                                SnpType::SnpCur => cache_update = false,
                                _ => return Err(CoherenceError::Protocol { opcode: "MemRd-Invalid", address: block_addr }),
                            }
                            S2MRsp::Cmp
                        }
                    }
                }
            }
            M2SReq::MemInv | M2SReq::MemInvNT => {
                cache_update = true;
                if req.meta_field == MetaField::NoOp {
                    debug_assert_eq!(req.snp_type, SnpType::SnpInv);
                    data_flush = true;
                    S2MRsp::Cmp
                } else {
                    match req.meta_value {
                        MetaValue::Any => {
                            debug_assert_eq!(req.snp_type, SnpType::SnpInv);
                            S2MRsp::CmpExclusive
                        }
                        MetaValue::Shared => {
                            debug_assert_eq!(req.snp_type, SnpType::SnpData);
                            if cache_cstate == LineState::Invalid {
                                S2MRsp::CmpExclusive
                            } else {
                                cache_nstate = LineState::Shared;
                                S2MRsp::CmpShared
                            }
                        }
                        MetaValue::Invalid => {
                            debug_assert_eq!(req.snp_type, SnpType::SnpInv);
                            data_flush = true;
                            S2MRsp::Cmp
                        }
                    }
                }
            }
            M2SReq::MemRdData => {
                debug_assert_eq!(req.snp_type, SnpType::SnpData);
                data_read = true;
                if cache_cstate == LineState::Invalid {
                    S2MRsp::CmpExclusive
                } else {
                    cache_update = true;
                    cache_nstate = LineState::Shared;
                    S2MRsp::CmpShared
                }
            }
            M2SReq::MemSpecRd => S2MRsp::Cmp,
            M2SReq::MemClnEvct => {
                debug_assert!(req.meta_value == MetaValue::Invalid || req.snp_type == SnpType::NoOp);
                S2MRsp::Cmp
            }
            M2SReq::MemWr | M2SReq::MemWrPtl => {
                data_write = true;
                cache_update = true;
                match req.meta_value {
                    MetaValue::Any | MetaValue::Shared => debug_assert_eq!(req.snp_type, SnpType::NoOp),
                    MetaValue::Invalid => {
                        debug_assert!(req.snp_type == SnpType::SnpInv || req.snp_type == SnpType::NoOp)
                    }
                }
                S2MRsp::Cmp
            }
            M2SReq::BIConflict => {
                debug_assert_eq!(req.snp_type, SnpType::NoOp);
                S2MRsp::BiConflictAck
            }
            M2SReq::MemRdFwd | M2SReq::MemWrFwd => S2MRsp::CmpError,
        },
    };

    if matches!(rsp, S2MRsp::CmpError) {
        return Ok((rsp, None));
    }

    let mut out_data = None;
    if data_read {
        out_data = Some(if cache_cstate != LineState::Invalid {
            *inner.device_cache.block(set, way.unwrap())
        } else {
            let bytes = inner.memory.read(backend_addr(block_addr), BLK)?;
            let mut block = [0u8; BLK];
            block.copy_from_slice(&bytes);
            block
        });
    }
    if data_write {
        let block = write_data.expect("a MemWr-class request must carry its write-through block");
        inner.memory.write(backend_addr(block_addr), block)?;
    }
    if data_flush && cache_cstate != LineState::Invalid {
        let data = *inner.device_cache.block(set, way.unwrap());
        inner.memory.write(backend_addr(block_addr), &data)?;
    }
    if cache_update && cache_cstate != LineState::Invalid {
        inner.device_cache.set_state(set, way.unwrap(), tag, cache_nstate);
    }

    if matches!(rsp, S2MRsp::Cmp) {
        inner.snoop_filter.remove(block_addr);
    } else {
        trace!(addr = format!("0x{block_addr:x}"), ?rsp, "host retains a snoop-filter entry");
        inner.snoop_filter.insert(block_addr);
    }

    if cache_cstate != LineState::Invalid {
        inner.device_cache.set_snoop_flag(set, way.unwrap(), !matches!(inner.bias.lookup(block_addr), BiasState::HostBias));
    }

    Ok((rsp, out_data))
}

/// Host HCOH's M2S response-to-cache-state table (§4.2.3): how the state the
/// host installs for a request it just issued follows from the opcode, the
/// request's own meta-value (for writes), and the response it got back.
fn response_check_state(req: &MemReq, rsp: S2MRsp) -> LineState {
    match req.opcode {
        M2SReq::MemInv | M2SReq::MemInvNT | M2SReq::MemRd => match rsp {
            S2MRsp::Cmp => LineState::Invalid,
            S2MRsp::CmpExclusive => LineState::Exclusive,
            S2MRsp::CmpShared => LineState::Shared,
            _ => unreachable!("dcoh_m2s already filtered CmpError before a caller reaches response_check"),
        },
        M2SReq::MemWr | M2SReq::MemWrPtl => {
            debug_assert_eq!(rsp, S2MRsp::Cmp);
            match req.meta_value {
                MetaValue::Any => LineState::Exclusive,
                MetaValue::Shared => LineState::Shared,
                MetaValue::Invalid => LineState::Invalid,
            }
        }
        _ => unreachable!("host_command and host_access only issue MemInv/MemRd/MemWr-class probes"),
    }
}

/// Host-biased branch of the DCOH M2S table collapses every non-`Shared`
/// meta-value (`Any`, `Invalid`) to a device-cache invalidate.
fn shared_or_invalid(mv: MetaValue) -> LineState {
    if mv == MetaValue::Shared {
        LineState::Shared
    } else {
        LineState::Invalid
    }
}

/// Device-local CPU-like access against device-biased memory (§4.3.3).
fn device_local_access<M: MemoryBackend>(
    inner: &mut Type2Inner<M>,
    daddr: u64,
    size: usize,
    write_bytes: Option<&[u8]>,
) -> Result<Vec<u8>, CoherenceError> {
    let block_addr = Cache::block_align(daddr);
    let offset = Cache::extract_offset(daddr);
    let tag = Cache::extract_tag(block_addr);
    let set = Cache::extract_set(block_addr);
    debug_assert_eq!(inner.bias.lookup(block_addr), BiasState::DeviceBias, "device-local access requires device bias");

    if let Some(way) = inner.device_cache.lookup(tag, set) {
        if write_bytes.is_some()
            && inner.snoop_filter.contains(block_addr)
            && inner.device_cache.state(set, way) == LineState::Shared
        {
            let (rsp, _) = host_bisnp(&mut inner.host_cache, &mut inner.memory, BiSnpReq::BISnpInv, block_addr)?;
            if matches!(rsp.as_block_unaware(), BiRsp::BINoOp) {
                return Err(CoherenceError::Protocol { opcode: "BISnpInv-unexpected-noop", address: block_addr });
            }
            debug_assert!(matches!(rsp.as_block_unaware(), BiRsp::BIRspI));
            inner.device_cache.set_state(set, way, tag, LineState::Exclusive);
            inner.snoop_filter.remove(block_addr);
        }
        if let Some(bytes) = write_bytes {
            inner.device_cache.write(set, way, offset, bytes);
            Ok(Vec::new())
        } else {
            Ok(inner.device_cache.read(set, way, offset, size))
        }
    } else {
        let way = inner.device_cache.find_invalid(set).unwrap_or_else(|| inner.device_cache.find_victim(set));
        if let Some(victim_addr) = inner.device_cache.assemble_address(set, way) {
            let data = *inner.device_cache.block(set, way);
            inner.memory.write(backend_addr(victim_addr), &data)?;
            inner.device_cache.set_state(set, way, Cache::extract_tag(victim_addr), LineState::Invalid);
        }
        let bytes = inner.memory.read(backend_addr(block_addr), BLK)?;
        let mut block = [0u8; BLK];
        block.copy_from_slice(&bytes);
        inner.device_cache.set_block(set, way, block);
        inner.device_cache.set_state(set, way, tag, LineState::Exclusive);

        if let Some(bytes) = write_bytes {
            inner.device_cache.write(set, way, offset, bytes);
            Ok(Vec::new())
        } else {
            Ok(inner.device_cache.read(set, way, offset, size))
        }
    }
}

/// Type-2 HCOH Back-Invalidate responder (§4.2.4): the device demands the
/// host downgrade or drop its opportunistic copy of a device-biased line.
fn host_bisnp<M: MemoryBackend>(
    host_cache: &mut Cache,
    memory: &mut M,
    req: BiSnpReq,
    block_addr: u64,
) -> Result<(BiRsp, Option<[u8; BLK]>), CoherenceError> {
    let tag = Cache::extract_tag(block_addr);
    let set = Cache::extract_set(block_addr);
    let way = host_cache.lookup(tag, set);
    let state = way.map(|w| host_cache.state(set, w)).unwrap_or(LineState::Invalid);
    let wants_blk = matches!(req, BiSnpReq::BISnpCurBlk | BiSnpReq::BISnpDataBlk | BiSnpReq::BISnpInvBlk);

    // A host cache with no line at all for this address is reported the same
    // as an invalidating response: nothing to downgrade or flush.
    let (plain, data) = if state == LineState::Invalid {
        (BiRsp::BIRspI, None)
    } else {
        let way = way.expect("state is non-Invalid only when lookup found a way");
        match req {
            BiSnpReq::BISnpCur | BiSnpReq::BISnpCurBlk => match state {
                LineState::Shared => (BiRsp::BIRspS, None),
                _ => (BiRsp::BIRspE, None),
            },
            BiSnpReq::BISnpData | BiSnpReq::BISnpDataBlk => match state {
                LineState::Shared => (BiRsp::BIRspS, None),
                LineState::Exclusive => {
                    host_cache.set_state(set, way, tag, LineState::Invalid);
                    (BiRsp::BIRspI, None)
                }
                _ => {
                    let block = *host_cache.block(set, way);
                    memory.write(backend_addr(block_addr), &block)?;
                    host_cache.set_state(set, way, tag, LineState::Invalid);
                    (BiRsp::BIRspI, Some(block))
                }
            },
            BiSnpReq::BISnpInv | BiSnpReq::BISnpInvBlk => match state {
                LineState::Modified => {
                    let block = *host_cache.block(set, way);
                    memory.write(backend_addr(block_addr), &block)?;
                    host_cache.set_state(set, way, tag, LineState::Invalid);
                    (BiRsp::BIRspI, Some(block))
                }
                _ => {
                    host_cache.set_state(set, way, tag, LineState::Invalid);
                    (BiRsp::BIRspI, None)
                }
            },
        }
    };

    let rsp = if wants_blk {
        match plain {
            BiRsp::BIRspI => BiRsp::BIRspIBlk,
            BiRsp::BIRspS => BiRsp::BIRspSBlk,
            BiRsp::BIRspE => BiRsp::BIRspEBlk,
            other => other,
        }
    } else {
        plain
    };
    Ok((rsp, data))
}
