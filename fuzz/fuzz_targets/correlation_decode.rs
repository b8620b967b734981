#![no_main]

//! Fuzz target for correlation blobs.
//!
//! Correlation blobs come back from the platform's transfer bookkeeping and
//! from journal rows written by older builds. Anything that fails to decode
//! has to surface as `CorrelationDecode`.

use ferry_delivery::correlation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(blob) = std::str::from_utf8(data) {
        if let Ok(record) = correlation::decode(blob) {
            let _ = correlation::encode(&record);
        }
    }
});
