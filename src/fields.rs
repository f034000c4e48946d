//! Wire element to extension mapping shared by the v9 and IPFIX decoders.
//!
//! NetFlow v9 field types below 128 coincide with the IANA IPFIX information
//! elements, so one table serves both template dialects. Elements the
//! collector does not carry map to skip sequences that keep the wire offsets
//! aligned; IPFIX structured data (292/293) maps to sub-template sequences.

use crate::extensions::{
    EX_AS_ROUTING, EX_BGP_NEXT_HOP_V4, EX_BGP_NEXT_HOP_V6, EX_CNT_FLOW, EX_FLOW_MISC,
    EX_GENERIC_FLOW, EX_IP_NEXT_HOP_V4, EX_IP_NEXT_HOP_V6, EX_IPV4_FLOW, EX_IPV6_FLOW, EX_VLAN,
    ExAsRouting, ExCntFlow, ExFlowMisc, ExGenericFlow, ExIpv4Flow, ExIpv6Flow, ExVlan,
};
use crate::sequencer::{CopyMode, SUB_TEMPLATE_LIST, SUB_TEMPLATE_MULTI_LIST, Sequence};

/// Value-stack slots filled by the sequencer and consumed by decoder
/// post-processing.
pub mod stack {
    /// flowStartSysUpTime (element 22), milliseconds relative to boot.
    pub const SYSUP_FIRST: u16 = 1;
    /// flowEndSysUpTime (element 21).
    pub const SYSUP_LAST: u16 = 2;
    /// flowStartSeconds (element 150).
    pub const SEC_FIRST: u16 = 3;
    /// flowEndSeconds (element 151).
    pub const SEC_LAST: u16 = 4;
    /// selectorId / samplerId (elements 302, 48).
    pub const SAMPLER_ID: u16 = 5;
    /// engineType (element 38).
    pub const ENGINE_TYPE: u16 = 6;
    /// engineId (element 39).
    pub const ENGINE_ID: u16 = 7;
}

fn copy(
    input_type: u16,
    input_length: u16,
    extension: u16,
    output_length: u16,
    offset: u16,
) -> Sequence {
    Sequence {
        input_type,
        input_length,
        extension,
        output_length,
        offset,
        stack_slot: 0,
        copy_mode: CopyMode::Int,
    }
}

fn stacked(input_type: u16, input_length: u16, slot: u16) -> Sequence {
    Sequence {
        input_type,
        input_length,
        extension: 0,
        output_length: 0,
        offset: 0,
        stack_slot: slot,
        copy_mode: CopyMode::Int,
    }
}

/// Maps one announced template field to its transcoding sequence.
///
/// Unknown elements become anonymous skips so the record layout stays intact;
/// compilation later merges adjacent skips.
pub fn lookup(field_type: u16, field_length: u16) -> Sequence {
    match field_type {
        // counters
        1 => copy(1, field_length, EX_GENERIC_FLOW, 8, ExGenericFlow::OFS_IN_BYTES),
        2 => copy(2, field_length, EX_GENERIC_FLOW, 8, ExGenericFlow::OFS_IN_PACKETS),
        3 => copy(3, field_length, EX_CNT_FLOW, 8, ExCntFlow::OFS_FLOWS),
        23 => copy(23, field_length, EX_CNT_FLOW, 8, ExCntFlow::OFS_OUT_BYTES),
        24 => copy(24, field_length, EX_CNT_FLOW, 8, ExCntFlow::OFS_OUT_PACKETS),

        // generic flow
        4 => copy(4, field_length, EX_GENERIC_FLOW, 1, ExGenericFlow::OFS_PROTO),
        5 => copy(5, field_length, EX_GENERIC_FLOW, 1, ExGenericFlow::OFS_SRC_TOS),
        6 => copy(6, field_length, EX_GENERIC_FLOW, 1, ExGenericFlow::OFS_TCP_FLAGS),
        7 => copy(7, field_length, EX_GENERIC_FLOW, 2, ExGenericFlow::OFS_SRC_PORT),
        11 => copy(11, field_length, EX_GENERIC_FLOW, 2, ExGenericFlow::OFS_DST_PORT),
        32 | 139 => copy(field_type, field_length, EX_GENERIC_FLOW, 2, ExGenericFlow::OFS_DST_PORT),
        89 => copy(89, field_length, EX_GENERIC_FLOW, 1, ExGenericFlow::OFS_FWD_STATUS),

        // addresses
        8 => copy(8, field_length, EX_IPV4_FLOW, 4, ExIpv4Flow::OFS_SRC_ADDR),
        12 => copy(12, field_length, EX_IPV4_FLOW, 4, ExIpv4Flow::OFS_DST_ADDR),
        27 => copy(27, field_length, EX_IPV6_FLOW, 16, ExIpv6Flow::OFS_SRC_ADDR),
        28 => copy(28, field_length, EX_IPV6_FLOW, 16, ExIpv6Flow::OFS_DST_ADDR),

        // misc
        9 => copy(9, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_SRC_MASK),
        13 => copy(13, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_DST_MASK),
        10 => copy(10, field_length, EX_FLOW_MISC, 4, ExFlowMisc::OFS_INPUT),
        14 => copy(14, field_length, EX_FLOW_MISC, 4, ExFlowMisc::OFS_OUTPUT),
        29 => copy(29, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_SRC_MASK),
        30 => copy(30, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_DST_MASK),
        55 => copy(55, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_DST_TOS),
        61 => copy(61, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_DIR),
        136 => copy(136, field_length, EX_FLOW_MISC, 1, ExFlowMisc::OFS_FLOW_END_REASON),

        // vlan
        58 => copy(58, field_length, EX_VLAN, 4, ExVlan::OFS_SRC_VLAN),
        59 => copy(59, field_length, EX_VLAN, 4, ExVlan::OFS_DST_VLAN),

        // routing
        15 => copy(15, field_length, EX_IP_NEXT_HOP_V4, 4, 0),
        62 => copy(62, field_length, EX_IP_NEXT_HOP_V6, 16, 0),
        16 => copy(16, field_length, EX_AS_ROUTING, 4, ExAsRouting::OFS_SRC_AS),
        17 => copy(17, field_length, EX_AS_ROUTING, 4, ExAsRouting::OFS_DST_AS),
        18 => copy(18, field_length, EX_BGP_NEXT_HOP_V4, 4, 0),
        63 => copy(63, field_length, EX_BGP_NEXT_HOP_V6, 16, 0),

        // timestamps: absolute milliseconds map straight into the record,
        // second and sysuptime variants are stacked for post-processing
        152 => copy(152, field_length, EX_GENERIC_FLOW, 8, ExGenericFlow::OFS_MSEC_FIRST),
        153 => copy(153, field_length, EX_GENERIC_FLOW, 8, ExGenericFlow::OFS_MSEC_LAST),
        150 => stacked(150, field_length, stack::SEC_FIRST),
        151 => stacked(151, field_length, stack::SEC_LAST),
        22 => stacked(22, field_length, stack::SYSUP_FIRST),
        21 => stacked(21, field_length, stack::SYSUP_LAST),

        // exporter metadata
        38 => stacked(38, field_length, stack::ENGINE_TYPE),
        39 => stacked(39, field_length, stack::ENGINE_ID),
        48 | 302 => stacked(field_type, field_length, stack::SAMPLER_ID),

        // IPFIX structured data
        SUB_TEMPLATE_LIST | SUB_TEMPLATE_MULTI_LIST => {
            Sequence::sub_template(field_type, field_length)
        }

        _ => Sequence::skip(field_length),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{Sequencer, VAR_LENGTH};

    #[test]
    fn unknown_fields_become_skips() {
        let seq = lookup(4711, 6);
        assert_eq!(seq.extension, 0);
        assert_eq!(seq.stack_slot, 0);
        assert_eq!(seq.input_length, 6);
    }

    #[test]
    fn scenario_template_compiles_to_two_extensions() {
        // (8:4) (12:4) (7:2) (11:2) (4:1) (1:8) (2:8)
        let table: Vec<Sequence> = [
            (8u16, 4u16),
            (12, 4),
            (7, 2),
            (11, 2),
            (4, 1),
            (1, 8),
            (2, 8),
        ]
        .iter()
        .map(|&(t, l)| lookup(t, l))
        .collect();
        let seq = Sequencer::compile(256, &table);
        assert_eq!(seq.in_length, 29);
        assert_eq!(
            seq.extensions,
            vec![crate::extensions::EX_GENERIC_FLOW, crate::extensions::EX_IPV4_FLOW]
        );
    }

    #[test]
    fn variable_length_announcement_kept() {
        let seq = lookup(4711, VAR_LENGTH);
        assert_eq!(seq.input_length, VAR_LENGTH);
    }
}
