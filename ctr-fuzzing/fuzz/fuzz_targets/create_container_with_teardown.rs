//! Container creation with a fresh daemon per input
//!
//! The daemon is stopped and its root removed after every input.

#![no_main]

use ctr_fuzzing::harness::run_shared;
use ctr_fuzzing::IterationStatus;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match run_shared(data, true) {
        Ok(IterationStatus::ConnectionFailed) => log::warn!("daemon unreachable, socket reset"),
        Ok(_) => {}
        Err(err) => panic!("fuzzing environment setup failed: {err}"),
    }
});
