#![no_main]

use libfuzzer_sys::fuzz_target;

use keyrack_core::{ContainerReader, ReadOptions, MIN_STRETCH_ITERATIONS};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1024 * 1024 {
        return;
    }
    // The declared stretch count sits after magic, version and salt; skip
    // inputs that would make every iteration-bound run dominate the corpus.
    if data.len() >= 42 {
        let iterations = u32::from_le_bytes([data[38], data[39], data[40], data[41]]);
        if iterations > MIN_STRETCH_ITERATIONS * 4 {
            return;
        }
    }
    let Ok(mut reader) = ContainerReader::open(data, "fuzz", ReadOptions::default()) else {
        return;
    };
    for _ in 0..4096 {
        match reader.read_record() {
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    let _ = reader.finish();
});
