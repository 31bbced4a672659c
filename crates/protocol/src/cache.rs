//! CXL.cache (D2H / H2D) request and response types, used by the Type-1 engines.

use serde::{Deserialize, Serialize};

/// Host-to-device snoop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum H2DReq {
    SnpData = 0,
    SnpInv = 1,
    SnpCur = 2,
}

/// Device response to an [`H2DReq`] snoop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum D2HRsp {
    RspIHitI = 0,
    RspVHitV = 1,
    RspIHitSE = 2,
    RspSHitSE = 3,
    RspSFwdM = 4,
    RspIFwdM = 5,
    RspVFwdV = 6,
    RspError = 7,
}

/// Device-to-host request against the host cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum D2HReq {
    RdCurr = 0,
    RdOwn = 1,
    RdShared = 2,
    RdAny = 3,
    RdOwnNoData = 4,
    ItoMWr = 5,
    WrCur = 6,
    CLFlush = 7,
    CleanEvict = 8,
    DirtyEvict = 9,
    CleanEvictNoData = 10,
    WOWrInv = 11,
    WOWrInvF = 12,
    WrInv = 13,
    CacheFlushed = 14,
}

/// Opcode half of a host response to a [`D2HReq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum H2DRspOpcode {
    WritePull = 0,
    Go = 1,
    GoWritePull = 2,
    ExtCmp = 3,
    WritePullDrop = 4,
    FastGoWritePull = 5,
    GoErrWritePull = 6,
}

/// Data-state half of a host response to a [`D2HReq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum H2DRspData {
    Invalid = 0,
    Shared = 1,
    Exclusive = 2,
    Modified = 3,
    Error = 4,
}

/// Full host-to-device response: `{opcode: 4 bits, rsp_pre: 2, rsp_data: 12, reserved: 14}`
/// on the wire. `rsp_pre` is carried as a plain field since the core never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2DRsp {
    pub opcode: H2DRspOpcode,
    pub rsp_pre: u8,
    pub data: H2DRspData,
}

impl H2DRsp {
    pub fn new(opcode: H2DRspOpcode, data: H2DRspData) -> Self {
        Self { opcode, rsp_pre: 0, data }
    }
}

/// CXL.cache request envelope: `{opcode: 5 bits, address: 46 bits}`, block-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReq {
    pub opcode: D2HReq,
    pub address: u64,
}

impl CacheReq {
    pub fn new(opcode: D2HReq, address: u64) -> Self {
        Self { opcode, address }
    }
}

/// The host-initiated counterpart: an [`H2DReq`] snoop plus its target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoopReq {
    pub opcode: H2DReq,
    pub address: u64,
}

impl SnoopReq {
    pub fn new(opcode: H2DReq, address: u64) -> Self {
        Self { opcode, address }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_req_round_trips_through_postcard() {
        let req = CacheReq::new(D2HReq::RdOwn, 0x4_9000_1000);
        let bytes = postcard::to_allocvec(&req).unwrap();
        let decoded: CacheReq = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn h2d_rsp_round_trips_through_postcard() {
        let rsp = H2DRsp::new(H2DRspOpcode::GoWritePull, H2DRspData::Modified);
        let bytes = postcard::to_allocvec(&rsp).unwrap();
        let decoded: H2DRsp = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(rsp, decoded);
    }

    #[test]
    fn discriminants_match_reference_bit_assignments() {
        assert_eq!(H2DReq::SnpInv as u8, 1);
        assert_eq!(D2HRsp::RspError as u8, 7);
        assert_eq!(D2HReq::CacheFlushed as u8, 14);
        assert_eq!(H2DRspOpcode::GoErrWritePull as u8, 6);
        assert_eq!(H2DRspData::Error as u8, 4);
    }
}
