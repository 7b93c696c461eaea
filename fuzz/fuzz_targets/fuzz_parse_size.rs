//! Fuzz target: size strings such as `512M` or `4G`.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(mib) = ark_core::parse_size_mib(input) {
            // A plain MiB count parses back to itself.
            assert_eq!(ark_core::parse_size_mib(&mib.to_string()).ok(), Some(mib));
        }
    }
});
