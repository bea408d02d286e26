#![no_main]

use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use phcsync::time::{CycleCounter, TimeBase};

#[derive(Debug, Arbitrary)]
struct Input {
    bits: u8,
    mult: u32,
    shift: u8,
    start: u64,
    steps: Vec<u32>,
}

fuzz_target!(|input: Input| {
    let bits = u32::from(input.bits % 32) + 1;
    let counter = CycleCounter::with_width(bits, input.mult.max(1), u32::from(input.shift % 32));
    let mut cycle = input.start & counter.mask;
    let mut timebase = TimeBase::new(counter, cycle, 0);

    let mut last = timebase.now();
    for step in input.steps {
        // reads must happen at least every half wrap
        let step = u64::from(step) & (counter.mask >> 1);
        cycle = cycle.wrapping_add(step) & counter.mask;

        let expected = timebase.cycle_to_time(cycle);
        let now = timebase.read(cycle);
        assert_eq!(now, expected);
        assert!(now >= last);
        last = now;

        if last > u64::MAX / 2 {
            break;
        }
    }
});
