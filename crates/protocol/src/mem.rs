//! CXL.mem (M2S / S2M) request and response types, used by the Type-2 engines.

use serde::{Deserialize, Serialize};

/// Per-region coherence authority for a Type-2 device's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BiasState {
    HostBias = 0,
    DeviceBias = 1,
}

/// Host-to-device (M2S) request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum M2SReq {
    MemInv = 0,
    MemRd = 1,
    MemRdData = 2,
    MemRdFwd = 3,
    MemWrFwd = 4,
    MemSpecRd = 5,
    MemInvNT = 6,
    MemClnEvct = 7,
    MemWr = 8,
    MemWrPtl = 9,
    BIConflict = 10,
}

/// Snoop type carried in an M2S request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SnpType {
    NoOp = 0,
    SnpData = 1,
    SnpCur = 2,
    SnpInv = 3,
}

/// Whether `meta_value` is meaningful for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetaField {
    Meta0State = 0,
    NoOp = 1,
}

/// Requested/observed coherence state carried in an M2S request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetaValue {
    Invalid = 0,
    Any = 1,
    Shared = 2,
}

/// Device-to-host (S2M) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum S2MRsp {
    Cmp = 0,
    CmpShared = 1,
    CmpExclusive = 2,
    BiConflictAck = 3,
    CmpError = 4,
}

/// Device-initiated Back-Invalidate snoop request (S2M direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BiSnpReq {
    BISnpCur = 0,
    BISnpData = 1,
    BISnpInv = 2,
    BISnpCurBlk = 3,
    BISnpDataBlk = 4,
    BISnpInvBlk = 5,
}

/// Host response to a [`BiSnpReq`] (M2S direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BiRsp {
    BINoOp = 0,
    BIRspI = 1,
    BIRspS = 2,
    BIRspE = 3,
    BIRspIBlk = 4,
    BIRspSBlk = 5,
    BIRspEBlk = 6,
}

impl BiRsp {
    /// Collapses the blocked and unblocked response variants that the core
    /// never distinguishes beyond "the line is now Invalid/Shared/Exclusive".
    pub fn as_block_unaware(self) -> Self {
        match self {
            BiRsp::BIRspIBlk => BiRsp::BIRspI,
            BiRsp::BIRspSBlk => BiRsp::BIRspS,
            BiRsp::BIRspEBlk => BiRsp::BIRspE,
            other => other,
        }
    }
}

/// CXL.mem request envelope: `{opcode: 4, snp_type: 3, meta_field: 2, meta_value: 2, address: 46}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemReq {
    pub opcode: M2SReq,
    pub snp_type: SnpType,
    pub meta_field: MetaField,
    pub meta_value: MetaValue,
    pub address: u64,
}

impl MemReq {
    pub fn new(
        opcode: M2SReq,
        snp_type: SnpType,
        meta_field: MetaField,
        meta_value: MetaValue,
        address: u64,
    ) -> Self {
        Self { opcode, snp_type, meta_field, meta_value, address }
    }
}

/// Device-initiated Back-Invalidate request, targeting a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiSnpPacket {
    pub opcode: BiSnpReq,
    pub address: u64,
}

impl BiSnpPacket {
    pub fn new(opcode: BiSnpReq, address: u64) -> Self {
        Self { opcode, address }
    }
}

/// The six fixed diagnostic probes exposed by `host_command` (see the spec's
/// `host_command` external interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemCommand {
    ReadMemInv = 0,
    NdrMemInv = 1,
    NdrMemShared = 2,
    NdrHCacheInv = 3,
    NdrSpecRd = 4,
    NdrClnEvct = 5,
}

impl MemCommand {
    /// The fixed `{opcode, snp_type, meta_value}` this probe assembles its
    /// request from. `meta_field` is always `Meta0State` since all six probes
    /// carry a meaningful meta value.
    pub fn request_shape(self) -> (M2SReq, SnpType, MetaValue) {
        match self {
            MemCommand::ReadMemInv => (M2SReq::MemRd, SnpType::SnpInv, MetaValue::Any),
            MemCommand::NdrMemInv => (M2SReq::MemInv, SnpType::SnpInv, MetaValue::Any),
            MemCommand::NdrMemShared => (M2SReq::MemInv, SnpType::SnpData, MetaValue::Shared),
            MemCommand::NdrHCacheInv => (M2SReq::MemInv, SnpType::SnpInv, MetaValue::Invalid),
            MemCommand::NdrSpecRd => (M2SReq::MemSpecRd, SnpType::NoOp, MetaValue::Invalid),
            MemCommand::NdrClnEvct => (M2SReq::MemClnEvct, SnpType::NoOp, MetaValue::Invalid),
        }
    }
}
