//! Property tests for frame packing and typed decoding.

use proptest::prelude::*;
use register_query::sim::SimController;
use register_query::{
    ControllerId, FrameEncoder, IntWidth, QueryClient, QueryConfig, QuerySpec, QuerySpecBuilder,
    RegisterAddress, Resolution, WireType,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

fn resolution() -> impl Strategy<Value = Resolution> {
    prop_oneof![
        Just(Resolution::Int8),
        Just(Resolution::UInt8),
        Just(Resolution::Int16),
        Just(Resolution::UInt16),
        Just(Resolution::Int32),
        Just(Resolution::UInt32),
        Just(Resolution::Float32),
        Just(Resolution::FixedPoint {
            width: IntWidth::W8,
            scale: 0.5
        }),
        Just(Resolution::FixedPoint {
            width: IntWidth::W16,
            scale: 0.25
        }),
        Just(Resolution::FixedPoint {
            width: IntWidth::W32,
            scale: 1.0 / 65536.0
        }),
    ]
}

/// Register sets with clustered addresses so that range reads actually form.
fn register_set() -> impl Strategy<Value = BTreeMap<RegisterAddress, Resolution>> {
    proptest::collection::btree_map((0u32..0x120).prop_map(RegisterAddress), resolution(), 0..40)
}

fn spec_of(regs: &BTreeMap<RegisterAddress, Resolution>) -> QuerySpec {
    regs.iter()
        .fold(QuerySpecBuilder::new(), |b, (a, r)| b.with(*a, *r))
        .build()
        .unwrap()
}

/// A value every resolution above represents exactly.
fn exact_value(res: Resolution, k: u8) -> f64 {
    let unit = match res {
        Resolution::FixedPoint { scale, .. } => scale,
        _ => 1.0,
    };
    f64::from(k % 100) * unit
}

proptest! {
    #[test]
    fn frames_partition_the_spec(regs in register_set(), max in 8usize..=64) {
        let spec = spec_of(&regs);
        let frames = FrameEncoder::new(max).encode(&spec).unwrap();

        let mut seen = BTreeSet::new();
        for frame in &frames {
            prop_assert!(!frame.payload().is_empty());
            prop_assert!(frame.payload().len() <= max);
            prop_assert!(frame.expected_reply_len() <= max);
            for addr in frame.addresses() {
                prop_assert!(seen.insert(addr), "{} requested twice", addr);
                prop_assert_eq!(frame.requested().get(&addr).copied(), regs.get(&addr).copied());
            }
        }
        let expected: BTreeSet<_> = regs.keys().copied().collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(frames.is_empty(), regs.is_empty());
    }

    #[test]
    fn int16_decodes_any_raw_value(raw in any::<i16>()) {
        let value = Resolution::Int16.decode(WireType::Int16, &raw.to_le_bytes());
        prop_assert_eq!(value, Some(f64::from(raw)));
        let unsigned = Resolution::UInt16.decode(WireType::Int16, &raw.to_le_bytes());
        prop_assert_eq!(unsigned, Some(f64::from(raw as u16)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn split_queries_merge_to_the_full_result(
        regs in register_set(),
        seeds in proptest::collection::vec(any::<u8>(), 40),
        max in 8usize..=64,
    ) {
        let ctrl = ControllerId::new(5).unwrap();
        let expected: BTreeMap<RegisterAddress, f64> = regs
            .iter()
            .zip(&seeds)
            .map(|((a, r), k)| (*a, exact_value(*r, *k)))
            .collect();
        let sim = regs
            .iter()
            .fold(SimController::new(ctrl), |s, (a, r)| {
                s.with_register(*a, *r, expected[a])
            });
        let mut bus = sim.into_bus("mock0");
        bus.set_max_payload(max);
        let client = QueryClient::new(bus, QueryConfig::default()).unwrap();

        let out = client
            .query(ctrl, &spec_of(&regs), Duration::from_millis(20))
            .unwrap();
        prop_assert_eq!(out.values(), &expected);
    }
}
