//! Property-style checks for the six invariants of §8. Several properties
//! (1, 5) are primarily structural and already covered by `cache.rs`'s and
//! `snoop_filter.rs`'s own inline unit tests; the versions here exercise the
//! same invariant through the public engine API where that is possible,
//! rather than duplicating the internal-state assertions verbatim.

use coherence::cache::{Cache, LineState};
use coherence::membackend::VecMemory;
use coherence::snoop_filter::SnoopFilter;
use coherence::{Type1Engine, Type2Engine};
use protocol::cache::{CacheReq, D2HReq};
use protocol::mem::{BiSnpPacket, BiSnpReq, S2MRsp};

const CFMWS_BASE_ADDR: u64 = 0x4_9000_0000;

fn type1_engine() -> Type1Engine<VecMemory> {
    Type1Engine::new(VecMemory::new(1 << 20))
}

fn type2_engine() -> Type2Engine<VecMemory> {
    Type2Engine::new(VecMemory::new(1 << 28))
}

/// 1. At most one way per set holds a given tag in non-Invalid state.
#[test]
fn invariant_1_at_most_one_way_per_set_per_tag() {
    let mut cache = Cache::new();
    let set = 1;
    for tag in 0..4u64 {
        let way = cache.find_invalid(set).expect("set has a free way");
        cache.set_state(set, way, tag, LineState::Shared);
    }
    for tag in 0..4u64 {
        let matching_ways = (0..4).filter(|&w| cache.state(set, w).is_valid() && {
            // reconstruct whether this way's tag equals `tag` the only way
            // the public API allows: by looking it up.
            cache.lookup(tag, set) == Some(w)
        });
        assert_eq!(matching_ways.count(), 1);
    }
}

/// 2. A write to address A followed by a same-side read of A returns the
/// written bytes, on both host and device sides of both engine types.
#[test]
fn invariant_2_write_then_read_round_trips() {
    let t1 = type1_engine();
    t1.host_write(0x800, &[1, 2, 3]).unwrap();
    assert_eq!(t1.host_read(0x800, 3).unwrap(), vec![1, 2, 3]);
    t1.device_write(0x900, &[4, 5, 6]).unwrap();
    assert_eq!(t1.device_read(0x900, 3).unwrap(), vec![4, 5, 6]);

    let t2 = type2_engine();
    t2.host_write(CFMWS_BASE_ADDR + 0x800, &[7, 8, 9]).unwrap();
    assert_eq!(t2.host_read(CFMWS_BASE_ADDR + 0x800, 3).unwrap(), vec![7, 8, 9]);
}

/// 3. Responses to device-initiated D2H requests stay within the opcode's
/// documented response family; none of the fixed probes ever produces a
/// response the table doesn't define for it.
#[test]
fn invariant_3_d2h_responses_stay_in_documented_family() {
    let e = type1_engine();
    let addr = 0x2000u64;
    e.host_write(addr, &[0x11]).unwrap();

    let always_go_writepull = [D2HReq::ItoMWr, D2HReq::WrCur, D2HReq::CleanEvict, D2HReq::DirtyEvict, D2HReq::WrInv];
    for req in always_go_writepull {
        let rsp = e.device_response(CacheReq::new(req, addr)).unwrap();
        assert!(matches!(
            rsp.opcode,
            protocol::cache::H2DRspOpcode::GoWritePull | protocol::cache::H2DRspOpcode::GoErrWritePull
        ));
    }
}

/// 4. Encoding and decoding a CXL.cache/CXL.mem packet yields the original
/// (already exercised per-type in `protocol`'s own unit tests; this
/// confirms it holds for the two packet kinds this crate threads through
/// its engine boundaries).
#[test]
fn invariant_4_packet_round_trip_through_postcard() {
    let cache_req = CacheReq::new(D2HReq::RdShared, 0x4_9000_0040);
    let bytes = postcard::to_allocvec(&cache_req).unwrap();
    assert_eq!(postcard::from_bytes::<CacheReq>(&bytes).unwrap(), cache_req);

    let bisnp = BiSnpPacket::new(BiSnpReq::BISnpData, 0x4_9800_0040);
    let bytes = postcard::to_allocvec(&bisnp).unwrap();
    assert_eq!(postcard::from_bytes::<BiSnpPacket>(&bytes).unwrap(), bisnp);
}

/// 5. Snoop-filter entries are block-aligned and track exactly the
/// addresses inserted since the last removal. The behavioral half (entries
/// appearing after a CMP_SHARED/CMP_EXCLUSIVE response and clearing after
/// BISnpInv) is exercised by the S2/S5 scenario tests instead, since the
/// live filter isn't reachable from outside an engine.
#[test]
fn invariant_5_snoop_filter_tracks_block_aligned_addresses() {
    let mut filter = SnoopFilter::new();
    let addr = 0x4_9800_1234u64;
    filter.insert(addr);
    assert!(filter.contains(Cache::block_align(addr)));
    filter.remove(addr);
    assert!(!filter.contains(Cache::block_align(addr)));
}

/// 6. Bias dispatch: a host-biased address never drives a BiConflictAck or
/// otherwise routes through Back-Invalidate machinery. Every access and
/// probe against it resolves through the plain CMP family.
#[test]
fn invariant_6_host_bias_never_drives_a_back_invalidate() {
    let e = type2_engine();
    let addr = CFMWS_BASE_ADDR + 0x4000; // entry 0, HOST_BIAS by construction

    e.host_write(addr, &[1, 2, 3, 4]).unwrap();
    assert_eq!(e.host_read(addr, 4).unwrap(), vec![1, 2, 3, 4]);

    let rsp = e.host_command(protocol::mem::MemCommand::NdrMemInv, addr).unwrap();
    assert!(matches!(rsp, S2MRsp::Cmp | S2MRsp::CmpExclusive | S2MRsp::CmpShared));
    assert!(!matches!(rsp, S2MRsp::BiConflictAck));
}
