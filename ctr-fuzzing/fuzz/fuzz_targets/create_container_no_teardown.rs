//! Container creation against a long-lived daemon
//!
//! The daemon started on the first input is reused by every later input.

#![no_main]

use ctr_fuzzing::harness::run_shared;
use ctr_fuzzing::IterationStatus;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match run_shared(data, false) {
        Ok(IterationStatus::ConnectionFailed) => log::warn!("daemon unreachable, socket reset"),
        Ok(_) => {}
        Err(err) => panic!("fuzzing environment setup failed: {err}"),
    }
});
