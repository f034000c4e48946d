//! End-to-end decoding scenarios across the public API.

use netflow_collector::extensions::{
    EX_AS_ROUTING, EX_GENERIC_FLOW, EX_IN_PAYLOAD, EX_IPV4_FLOW, ExGenericFlow, ExIpReceivedV4,
    ExIpv4Flow,
};
use netflow_collector::record::{DataBlock, MemBlockWriter, RecordView, records, verify_v3_record};
use netflow_collector::sequencer::{
    CopyMode, NoSubTemplates, STACK_SIZE, Sequence, Sequencer, VAR_LENGTH,
};
use netflow_collector::{Collector, ja3, tls};

use std::net::IpAddr;

fn source() -> IpAddr {
    "203.0.113.7".parse().unwrap()
}

/// NetFlow v1: single 48-byte record behind a 16-byte header.
#[test]
fn netflow_v1_single_record() {
    let mut d = Vec::new();
    d.extend_from_slice(&1u16.to_be_bytes()); // version
    d.extend_from_slice(&1u16.to_be_bytes()); // count
    d.extend_from_slice(&5000u32.to_be_bytes()); // sys_up_time
    d.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // unix_secs
    d.extend_from_slice(&0u32.to_be_bytes()); // unix_nsecs
    d.extend_from_slice(&[10, 0, 0, 1]); // src
    d.extend_from_slice(&[10, 0, 0, 2]); // dst
    d.extend_from_slice(&[0, 0, 0, 0]); // next hop
    d.extend_from_slice(&0u16.to_be_bytes()); // input
    d.extend_from_slice(&0u16.to_be_bytes()); // output
    d.extend_from_slice(&1u32.to_be_bytes()); // d_pkts
    d.extend_from_slice(&60u32.to_be_bytes()); // d_octets
    d.extend_from_slice(&1000u32.to_be_bytes()); // first
    d.extend_from_slice(&2000u32.to_be_bytes()); // last
    d.extend_from_slice(&1234u16.to_be_bytes()); // src port
    d.extend_from_slice(&80u16.to_be_bytes()); // dst port
    d.extend_from_slice(&0u16.to_be_bytes()); // pad1
    d.push(6); // proto
    d.push(0); // tos
    d.push(0x12); // tcp flags
    d.extend_from_slice(&[0u8; 7]); // pad2
    assert_eq!(d.len(), 16 + 48);

    let mut collector = Collector::default();
    let mut block = DataBlock::default();
    let mut writer = MemBlockWriter::default();
    let summary = collector
        .process_datagram(source(), 1_700_000_000_000, &d, &mut block, &mut writer)
        .unwrap();
    assert_eq!(summary.records, 1);

    let rec = records(&block).next().unwrap();
    assert!(verify_v3_record(rec));
    let view = RecordView::parse(rec).unwrap();
    assert_eq!(view.nf_version, 1);

    let generic: ExGenericFlow = view.get().unwrap();
    assert_eq!(generic.msec_first, 1_699_999_996_000);
    assert_eq!(generic.msec_last, 1_699_999_997_000);
    assert_eq!(generic.in_packets, 1);
    assert_eq!(generic.in_bytes, 60);
    assert_eq!(generic.proto, 6);
    assert_eq!(generic.src_port, 1234);
    assert_eq!(generic.dst_port, 80);

    let ipv4: ExIpv4Flow = view.get().unwrap();
    assert_eq!(ipv4.src_addr.octets(), [10, 0, 0, 1]);
    assert_eq!(ipv4.dst_addr.octets(), [10, 0, 0, 2]);

    let received: ExIpReceivedV4 = view.get().unwrap();
    assert_eq!(received.ip.octets(), [203, 0, 113, 7]);

    assert_eq!(collector.stat.numflows_tcp, 1);
}

fn ipfix_message(sets: &[Vec<u8>], sequence: u32) -> Vec<u8> {
    let body: usize = sets.iter().map(Vec::len).sum();
    let mut d = Vec::new();
    d.extend_from_slice(&10u16.to_be_bytes());
    d.extend_from_slice(&((16 + body) as u16).to_be_bytes());
    d.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // export_time
    d.extend_from_slice(&sequence.to_be_bytes());
    d.extend_from_slice(&99u32.to_be_bytes()); // observation domain
    for s in sets {
        d.extend_from_slice(s);
    }
    d
}

/// IPFIX: template then data; the record carries exactly the announced
/// extensions.
#[test]
fn ipfix_template_and_data() {
    let mut template_set = Vec::new();
    template_set.extend_from_slice(&2u16.to_be_bytes());
    template_set.extend_from_slice(&((4 + 4 + 7 * 4) as u16).to_be_bytes());
    template_set.extend_from_slice(&256u16.to_be_bytes());
    template_set.extend_from_slice(&7u16.to_be_bytes());
    for (t, l) in [(8u16, 4u16), (12, 4), (7, 2), (11, 2), (4, 1), (1, 8), (2, 8)] {
        template_set.extend_from_slice(&t.to_be_bytes());
        template_set.extend_from_slice(&l.to_be_bytes());
    }

    let mut data_set = Vec::new();
    data_set.extend_from_slice(&256u16.to_be_bytes());
    data_set.extend_from_slice(&((4 + 29) as u16).to_be_bytes());
    data_set.extend_from_slice(&[192, 168, 1, 1]);
    data_set.extend_from_slice(&[192, 168, 1, 2]);
    data_set.extend_from_slice(&40001u16.to_be_bytes());
    data_set.extend_from_slice(&443u16.to_be_bytes());
    data_set.push(17);
    data_set.extend_from_slice(&9000u64.to_be_bytes()); // octets
    data_set.extend_from_slice(&12u64.to_be_bytes()); // packets

    let mut collector = Collector::default();
    let mut block = DataBlock::default();
    let mut writer = MemBlockWriter::default();
    let summary = collector
        .process_datagram(
            source(),
            0,
            &ipfix_message(&[template_set, data_set], 0),
            &mut block,
            &mut writer,
        )
        .unwrap();
    assert_eq!(summary.version, 10);
    assert_eq!(summary.records, 1);

    let rec = records(&block).next().unwrap();
    assert!(verify_v3_record(rec));
    let view = RecordView::parse(rec).unwrap();
    assert_eq!(view.nf_version, 10);
    assert!(view.has(EX_GENERIC_FLOW));
    assert!(view.has(EX_IPV4_FLOW));

    let generic: ExGenericFlow = view.get().unwrap();
    assert_eq!(generic.src_port, 40001);
    assert_eq!(generic.dst_port, 443);
    assert_eq!(generic.proto, 17);
    assert_eq!(generic.in_bytes, 9000);
    assert_eq!(generic.in_packets, 12);

    let ipv4: ExIpv4Flow = view.get().unwrap();
    assert_eq!(ipv4.src_addr.octets(), [192, 168, 1, 1]);
    assert_eq!(ipv4.dst_addr.octets(), [192, 168, 1, 2]);

    assert_eq!(collector.stat.numflows_udp, 1);
}

/// Variable-length field: one length-prefixed string into a byte-copy
/// extension.
#[test]
fn variable_length_field_round_trip() {
    let table = [Sequence {
        input_type: 82,
        input_length: VAR_LENGTH,
        extension: EX_IN_PAYLOAD,
        output_length: VAR_LENGTH,
        offset: 0,
        stack_slot: 0,
        copy_mode: CopyMode::Bytes,
    }];
    let seq = Sequencer::compile(300, &table);

    let wire = [5u8, b'h', b'e', b'l', b'l', b'o'];
    let mut block = DataBlock::default();
    let mut rec =
        netflow_collector::record::RecordWriter::new(&mut block, 10, 0, 0, 1).unwrap();
    let mut stack = [0u64; STACK_SIZE];
    let outcome = seq.run(&NoSubTemplates, &wire, &mut rec, &mut stack).unwrap();
    assert_eq!(outcome.consumed, 6);
    let size = rec.finish();
    // record length = header + element header + 5 payload bytes
    assert_eq!(size as usize, 14 + 4 + 5);

    let rec = records(&block).next().unwrap();
    assert!(verify_v3_record(rec));
    let view = RecordView::parse(rec).unwrap();
    assert_eq!(view.raw(EX_IN_PAYLOAD), Some(&b"hello"[..]));
}

/// IPFIX subTemplateList: a parent record wrapping three sub-records emits
/// one element per sub-record.
#[test]
fn ipfix_sub_template_list() {
    // parent template 256: a single variable-length subTemplateList field
    let mut template_set = Vec::new();
    template_set.extend_from_slice(&2u16.to_be_bytes());
    template_set.extend_from_slice(&((4 + 4 + 4 + 4 + 4) as u16).to_be_bytes());
    template_set.extend_from_slice(&256u16.to_be_bytes());
    template_set.extend_from_slice(&1u16.to_be_bytes());
    template_set.extend_from_slice(&292u16.to_be_bytes());
    template_set.extend_from_slice(&0xFFFFu16.to_be_bytes());
    // sub template 300: one u32 into asRouting
    template_set.extend_from_slice(&300u16.to_be_bytes());
    template_set.extend_from_slice(&1u16.to_be_bytes());
    template_set.extend_from_slice(&16u16.to_be_bytes());
    template_set.extend_from_slice(&4u16.to_be_bytes());

    // data record: varlen prefix, semantic byte, sub template id, 3 x u32
    let mut list = vec![0x03];
    list.extend_from_slice(&300u16.to_be_bytes());
    for asn in [64500u32, 64501, 64502] {
        list.extend_from_slice(&asn.to_be_bytes());
    }
    let mut data_set = Vec::new();
    data_set.extend_from_slice(&256u16.to_be_bytes());
    data_set.extend_from_slice(&((4 + 1 + list.len()) as u16).to_be_bytes());
    data_set.push(list.len() as u8);
    data_set.extend_from_slice(&list);

    let mut collector = Collector::default();
    let mut block = DataBlock::default();
    let mut writer = MemBlockWriter::default();
    let summary = collector
        .process_datagram(
            source(),
            0,
            &ipfix_message(&[template_set, data_set], 0),
            &mut block,
            &mut writer,
        )
        .unwrap();
    assert_eq!(summary.records, 1);

    let rec = records(&block).next().unwrap();
    assert!(verify_v3_record(rec));
    // one asRouting element per sub-record
    let num_elements = u16::from_le_bytes([rec[4], rec[5]]);
    assert_eq!(num_elements, 3);
    let view = RecordView::parse(rec).unwrap();
    assert!(view.has(EX_AS_ROUTING));
}

/// JA3 of the known Firefox-style ClientHello.
#[test]
fn tls_client_hello_ja3() {
    // reuse the canned hello through the tls parser entry point
    let hello = tls::parse(MOZILLA_CLIENT_HELLO).expect("hello parses");
    assert_eq!(hello.sni_name, "contile.services.mozilla.com");
    assert_eq!(hello.alpn_name, "h2");
    assert_eq!(
        ja3::ja3_string(&hello),
        "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,\
         0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0"
    );
    assert_eq!(ja3::ja3_fingerprint(&hello), "579ccef312d18482fc42e2b822ca2430");
}

/// TLS parser robustness: random inputs return cleanly.
#[test]
fn tls_random_inputs_never_panic() {
    let mut state = 0x123456789ABCDEFu64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for _ in 0..2000 {
        let len = (next() % 1024) as usize;
        let mut data: Vec<u8> = (0..len).map(|_| next() as u8).collect();
        if !data.is_empty() {
            data[0] = 0x16; // keep the parser past the record type check
        }
        let _ = tls::parse(&data);
    }
}

const MOZILLA_CLIENT_HELLO: &[u8] = &[
    0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03, 0xec, 0xb2, 0x69, 0x1a,
    0xdd, 0xb2, 0xbf, 0x6c, 0x59, 0x9c, 0x7a, 0xaa, 0xe2, 0x3d, 0xe5, 0xf4, 0x25, 0x61, 0xcc,
    0x04, 0xeb, 0x41, 0x02, 0x9a, 0xcc, 0x6f, 0xc0, 0x50, 0xa1, 0x6a, 0xc1, 0xd2, 0x20, 0x46,
    0xf8, 0x61, 0x7b, 0x58, 0x0a, 0xc9, 0x35, 0x8e, 0x2a, 0xa4, 0x4e, 0x30, 0x6d, 0x52, 0x46,
    0x6b, 0xcc, 0x98, 0x9c, 0x87, 0xc8, 0xca, 0x64, 0x30, 0x9f, 0x5f, 0xaf, 0x50, 0xba, 0x7b,
    0x4d, 0x00, 0x22, 0x13, 0x01, 0x13, 0x03, 0x13, 0x02, 0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9,
    0xcc, 0xa8, 0xc0, 0x2c, 0xc0, 0x30, 0xc0, 0x0a, 0xc0, 0x09, 0xc0, 0x13, 0xc0, 0x14, 0x00,
    0x9c, 0x00, 0x9d, 0x00, 0x2f, 0x00, 0x35, 0x01, 0x00, 0x01, 0x91, 0x00, 0x00, 0x00, 0x21,
    0x00, 0x1f, 0x00, 0x00, 0x1c, 0x63, 0x6f, 0x6e, 0x74, 0x69, 0x6c, 0x65, 0x2e, 0x73, 0x65,
    0x72, 0x76, 0x69, 0x63, 0x65, 0x73, 0x2e, 0x6d, 0x6f, 0x7a, 0x69, 0x6c, 0x6c, 0x61, 0x2e,
    0x63, 0x6f, 0x6d, 0x00, 0x17, 0x00, 0x00, 0xff, 0x01, 0x00, 0x01, 0x00, 0x00, 0x0a, 0x00,
    0x0e, 0x00, 0x0c, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18, 0x00, 0x19, 0x01, 0x00, 0x01, 0x01,
    0x00, 0x0b, 0x00, 0x02, 0x01, 0x00, 0x00, 0x23, 0x00, 0x00, 0x00, 0x10, 0x00, 0x0e, 0x00,
    0x0c, 0x02, 0x68, 0x32, 0x08, 0x68, 0x74, 0x74, 0x70, 0x2f, 0x31, 0x2e, 0x31, 0x00, 0x05,
    0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x00, 0x0a, 0x00, 0x08, 0x04, 0x03,
    0x05, 0x03, 0x06, 0x03, 0x02, 0x03, 0x00, 0x33, 0x00, 0x6b, 0x00, 0x69, 0x00, 0x1d, 0x00,
    0x20, 0x89, 0x09, 0x85, 0x8f, 0xbe, 0xb6, 0xed, 0x2f, 0x12, 0x48, 0xba, 0x5b, 0x9e, 0x29,
    0x78, 0xbe, 0xad, 0x0e, 0x84, 0x01, 0x10, 0x19, 0x2c, 0x61, 0xda, 0xed, 0x00, 0x96, 0x79,
    0x8b, 0x18, 0x44, 0x00, 0x17, 0x00, 0x41, 0x04, 0x4d, 0x18, 0x3d, 0x91, 0xf5, 0xee, 0xd3,
    0x57, 0x91, 0xfa, 0x98, 0x24, 0x64, 0xe3, 0xb0, 0x21, 0x4a, 0xaa, 0x5f, 0x5d, 0x1b, 0x78,
    0x61, 0x6d, 0x9b, 0x9f, 0xbe, 0xbc, 0x22, 0xd1, 0x1f, 0x53, 0x5b, 0x2f, 0x94, 0xc6, 0x86,
    0x14, 0x31, 0x36, 0xaa, 0x79, 0x5e, 0x6e, 0x5a, 0x87, 0x5d, 0x6c, 0x08, 0x06, 0x4a, 0xd5,
    0xb7, 0x6d, 0x44, 0xca, 0xad, 0x76, 0x6e, 0x24, 0x83, 0x01, 0x27, 0x48, 0x00, 0x2b, 0x00,
    0x05, 0x04, 0x03, 0x04, 0x03, 0x03, 0x00, 0x0d, 0x00, 0x18, 0x00, 0x16, 0x04, 0x03, 0x05,
    0x03, 0x06, 0x03, 0x08, 0x04, 0x08, 0x05, 0x08, 0x06, 0x04, 0x01, 0x05, 0x01, 0x06, 0x01,
    0x02, 0x03, 0x02, 0x01, 0x00, 0x2d, 0x00, 0x02, 0x01, 0x01, 0x00, 0x1c, 0x00, 0x02, 0x40,
    0x01, 0x00, 0x15, 0x00, 0x7a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
