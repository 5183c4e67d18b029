use cidet::addressing::{solve, AddressShape, AddressSkip};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn addr_mask(addr_bytes: u8) -> u64 {
    match addr_bytes {
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn disp_in_range(disp: i64, disp_size: u8) -> bool {
    match disp_size {
        0 => disp == 0,
        1 => i8::try_from(disp).is_ok(),
        2 => i16::try_from(disp).is_ok(),
        _ => i32::try_from(disp).is_ok(),
    }
}

fn addressing_params(addr_bytes: u8) -> (u8, &'static [u8], &'static [u8]) {
    if addr_bytes == 2 {
        (8, &[0, 1, 2], &[1])
    } else {
        (16, &[0, 1, 4], &[1, 2, 4, 8])
    }
}

fn nonzero_disp_sizes(addr_bytes: u8) -> &'static [u8] {
    if addr_bytes == 2 {
        &[1, 2]
    } else {
        &[1, 4]
    }
}

fn addr_bytes_strategy() -> impl Strategy<Value = u8> {
    prop_oneof![Just(2u8), Just(4u8), Just(8u8)]
}

/// Register-based shapes that ModR/M and SIB can actually express.
fn shape_strategy() -> impl Strategy<Value = AddressShape> {
    addr_bytes_strategy().prop_flat_map(|addr_bytes| {
        let (regs, disp_sizes, scales) = addressing_params(addr_bytes);
        (
            proptest::option::of(0..regs),
            proptest::option::of(0..regs),
            proptest::sample::select(scales),
            proptest::sample::select(disp_sizes),
        )
            .prop_map(move |(base, index, scale, disp_size)| AddressShape {
                base,
                index,
                scale,
                disp_size,
                rip_relative: false,
                addr_bytes,
            })
    })
}

prop_compose! {
    /// A base register plus an optional index that never aliases it.
    fn distinct_base_shape()(addr_bytes in addr_bytes_strategy())(
        addr_bytes in Just(addr_bytes),
        base in 0..addressing_params(addr_bytes).0,
        index in proptest::option::of(0..addressing_params(addr_bytes).0 - 1),
        scale in proptest::sample::select(addressing_params(addr_bytes).2),
        disp_size in proptest::sample::select(addressing_params(addr_bytes).1),
    ) -> AddressShape {
        AddressShape {
            base: Some(base),
            index: index.map(|i| if i >= base { i + 1 } else { i }),
            scale,
            disp_size,
            rip_relative: false,
            addr_bytes,
        }
    }
}

prop_compose! {
    /// Indexed shapes that always carry a displacement.
    fn indexed_disp_shape()(addr_bytes in addr_bytes_strategy())(
        addr_bytes in Just(addr_bytes),
        base in proptest::option::of(0..addressing_params(addr_bytes).0),
        index in 0..addressing_params(addr_bytes).0,
        scale in proptest::sample::select(addressing_params(addr_bytes).2),
        disp_size in proptest::sample::select(nonzero_disp_sizes(addr_bytes)),
    ) -> AddressShape {
        AddressShape {
            base,
            index: Some(index),
            scale,
            disp_size,
            rip_relative: false,
            addr_bytes,
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        .. ProptestConfig::default()
    })]

    #[test]
    fn solutions_hit_the_target(
        shape in shape_strategy(),
        target in any::<u64>(),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let target = target & addr_mask(shape.addr_bytes);
        if let Ok(sol) = solve(&shape, target, 0, &mut rng) {
            prop_assert_eq!(sol.effective_offset(&shape, 0), target);
            prop_assert!(disp_in_range(sol.disp, shape.disp_size), "{:?}", sol);
            if shape.base.is_some() && shape.base == shape.index {
                prop_assert_eq!(sol.base_value, sol.index_value);
            }
        }
    }

    #[test]
    fn distinct_base_always_reaches(
        shape in distinct_base_shape(),
        target in any::<u64>(),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let target = target & addr_mask(shape.addr_bytes);
        let sol = solve(&shape, target, 0, &mut rng).unwrap();
        prop_assert_eq!(sol.effective_offset(&shape, 0), target);
    }

    #[test]
    fn scaled_forms_with_disp_only_fail_at_the_top(
        shape in indexed_disp_shape(),
        target in any::<u64>(),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mask = addr_mask(shape.addr_bytes);
        // Above the largest displacement and well below the top, so `target - disp` never wraps
        // and the rounding nudge never overflows.
        let max_disp = match shape.disp_size {
            1 => 0x7f,
            2 => 0x7fff,
            _ => 0x7fff_ffff,
        };
        let target = max_disp + 1 + target % (mask / 4);
        prop_assert!(solve(&shape, target, 0, &mut rng).is_ok());
    }

    #[test]
    fn rip_relative_reaches_exactly_the_rel32_window(
        next_ip in any::<u64>(),
        delta in any::<i64>(),
        seed in any::<u64>(),
    ) {
        let shape = AddressShape {
            base: None,
            index: None,
            scale: 1,
            disp_size: 4,
            rip_relative: true,
            addr_bytes: 8,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let target = next_ip.wrapping_add(delta as u64);
        match solve(&shape, target, next_ip, &mut rng) {
            Ok(sol) => {
                prop_assert!(i32::try_from(delta).is_ok());
                prop_assert_eq!(sol.disp, delta);
                prop_assert_eq!(sol.effective_offset(&shape, next_ip), target);
            }
            Err(skip) => {
                prop_assert_eq!(skip, AddressSkip::RipRelativeOutOfRange);
                prop_assert!(i32::try_from(delta).is_err());
            }
        }
    }
}

#[test]
fn sixteen_bit_direct_addressing_covers_the_segment() {
    let shape = AddressShape {
        base: None,
        index: None,
        scale: 1,
        disp_size: 2,
        rip_relative: false,
        addr_bytes: 2,
    };
    let mut rng = StdRng::seed_from_u64(0);
    for target in [0, 0x7fff, 0x8000, 0xffff] {
        let sol = solve(&shape, target, 0, &mut rng).unwrap();
        assert_eq!(sol.effective_offset(&shape, 0), target);
    }
}
