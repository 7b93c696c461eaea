//! Fuzz target: JSON body of `POST /vm/create` through validation.
//!
//! Arbitrary bytes must never panic the deserializer or `VmSpec::parse`.

#![no_main]

use ark_gateway::routes::CreateVmBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = serde_json::from_slice::<CreateVmBody>(data) {
        if let Ok(spec) = body.into_spec() {
            assert!(spec.cpus >= 1);
            assert!(spec.memory_mib >= 1);
        }
    }
});
