use criterion::{Criterion, criterion_group, criterion_main};
use netflow_collector::{Collector, DataBlock, MemBlockWriter};
use std::hint::black_box;

fn v5_packet() -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&5u16.to_be_bytes());
    d.extend_from_slice(&1u16.to_be_bytes());
    d.extend_from_slice(&5000u32.to_be_bytes());
    d.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    d.extend_from_slice(&0u32.to_be_bytes());
    d.extend_from_slice(&1u32.to_be_bytes());
    d.extend_from_slice(&[0, 0]);
    d.extend_from_slice(&0u16.to_be_bytes());
    d.extend_from_slice(&[10, 0, 0, 1]);
    d.extend_from_slice(&[10, 0, 0, 2]);
    d.extend_from_slice(&[0, 0, 0, 0]);
    d.extend_from_slice(&1u16.to_be_bytes());
    d.extend_from_slice(&2u16.to_be_bytes());
    d.extend_from_slice(&1u32.to_be_bytes());
    d.extend_from_slice(&60u32.to_be_bytes());
    d.extend_from_slice(&1000u32.to_be_bytes());
    d.extend_from_slice(&2000u32.to_be_bytes());
    d.extend_from_slice(&1234u16.to_be_bytes());
    d.extend_from_slice(&80u16.to_be_bytes());
    d.extend_from_slice(&[0, 0x10, 6, 0]);
    d.extend_from_slice(&[0, 0, 0, 0, 24, 16, 0, 0]);
    d
}

fn criterion_benchmark(c: &mut Criterion) {
    let packet = v5_packet();
    c.bench_function("netflow_v5 decode", |b| {
        let mut collector = Collector::default();
        let mut block = DataBlock::default();
        let mut writer = MemBlockWriter::default();
        let source = "192.0.2.1".parse().unwrap();
        b.iter(|| {
            let _ = collector.process_datagram(source, 0, black_box(&packet), &mut block, &mut writer);
            if block.remaining() < 4096 {
                block.reset();
            }
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
