#![no_main]

use libfuzzer_sys::fuzz_target;
use netflow_collector::{Collector, DataBlock, MemBlockWriter};

fuzz_target!(|data: &[u8]| {
    let mut collector = Collector::default();
    let mut block = DataBlock::default();
    let mut writer = MemBlockWriter::default();
    let source = "192.0.2.1".parse().unwrap();
    let _ = collector.process_datagram(source, 0, data, &mut block, &mut writer);
});
