//! Runs `MemAlloc` as the global allocator next to a logger that allocates for every
//! record it writes. Without the `trace` feature the heap never logs per operation, so
//! the logger's allocations can't wait on the lock the heap is holding.
#![cfg(all(unix, not(feature = "trace")))]

use log::{Level, LevelFilter, Log, Metadata, Record};
use segalloc::MemAlloc;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

/// Formats trace records into a fresh `String`.
struct AllocatingLogger;

impl Log for AllocatingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() == Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line = format!("{}: {}", record.target(), record.args());
            std::hint::black_box(line);
        }
    }

    fn flush(&self) {}
}

static LOGGER: AllocatingLogger = AllocatingLogger;

#[test]
fn allocating_logger_does_not_block_the_heap() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let mut blocks: Vec<Vec<u8>> = (1..200).map(|len| vec![len as u8; len]).collect();
    for block in blocks.iter_mut().step_by(2) {
        block.extend_from_slice(&[0xEE; 300]);
    }
    blocks.retain(|block| block.len() < 300);

    assert_eq!(99, blocks.len());
    assert!(blocks.iter().all(|block| block.iter().all(|&b| b == block.len() as u8)));
}
