#![no_main]

use libfuzzer_sys::fuzz_target;
use phcsync::RatioRegister;

fuzz_target!(|ratio: f64| {
    match RatioRegister::encode(ratio) {
        Ok(register) => {
            assert!(ratio > 0.0 && ratio < 2.0);
            assert!((register.decode() - ratio).abs() <= 1.0 / (1u64 << 31) as f64);
            assert_eq!(RatioRegister::from_bits(register.bits()), register);
        }
        Err(_) => assert!(!(ratio > 0.0 && ratio < 2.0)),
    }
});
