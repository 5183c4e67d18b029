//! Solves register and displacement values that make a memory operand hit a target address.

use rand::Rng;
use thiserror::Error;

use crate::operand::{sign_extend, size_mask, BYTE_SIZE_TO_MAX};

/// The addressing form of one memory operand, as chosen by the enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressShape {
    pub base: Option<u8>,
    pub index: Option<u8>,
    /// 1, 2, 4 or 8.
    pub scale: u8,
    /// 0, 1, 2 or 4.
    pub disp_size: u8,
    pub rip_relative: bool,
    /// Address size in bytes: 2, 4 or 8.
    pub addr_bytes: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressSolution {
    pub base_value: u64,
    pub index_value: u64,
    /// Sign-extended displacement.
    pub disp: i64,
}

/// Why a shape cannot reach a target. Each maps to a skip counter.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AddressSkip {
    #[error("target is out of rel32 range of the next instruction")]
    RipRelativeOutOfRange,
    #[error("target is not a multiple of the aliased base+index scale")]
    SameBaseIndexRemainder,
    #[error("target is not a multiple of the index scale")]
    OnlyIndexRemainder,
    #[error("target does not fit the displacement")]
    DirectAddressingOverflow,
}

impl AddressSolution {
    /// Offset the CPU computes for this solution.
    pub fn effective_offset(&self, shape: &AddressShape, next_ip: u64) -> u64 {
        let mask = size_mask(shape.addr_bytes);
        let disp = self.disp as u64;
        if shape.rip_relative {
            return next_ip.wrapping_add(disp) & mask;
        }
        let mut sum = disp;
        if shape.base.is_some() {
            sum = sum.wrapping_add(self.base_value);
        }
        if shape.index.is_some() {
            sum = sum.wrapping_add(self.index_value.wrapping_mul(u64::from(shape.scale)));
        }
        sum & mask
    }
}

/// `value` survives sign extension from `disp_size` bytes to the address width.
fn fits_disp(value: u64, disp_size: u8, addr_bytes: u8) -> bool {
    if disp_size >= addr_bytes {
        return true;
    }
    (sign_extend(value, disp_size) as u64) & size_mask(addr_bytes) == value
}

fn random_disp<R: Rng + ?Sized>(rng: &mut R, disp_size: u8) -> i64 {
    if disp_size == 0 {
        0
    } else {
        sign_extend(rng.gen::<u64>(), disp_size)
    }
}

/// Splits `target` into `quotient * divisor + disp` with a random displacement nudged so the
/// remainder lands in it. Without a displacement the target has to divide evenly.
fn split_with_disp<R: Rng + ?Sized>(
    target: u64,
    divisor: u64,
    disp_size: u8,
    mask: u64,
    rng: &mut R,
) -> Option<(u64, i64)> {
    if disp_size == 0 {
        return (target % divisor == 0).then(|| (target / divisor, 0));
    }

    let max = BYTE_SIZE_TO_MAX[usize::from(disp_size)];
    let mut disp = random_disp(rng, disp_size);
    let mut off = target.wrapping_sub(disp as u64) & mask;
    let rem = off % divisor;
    if rem != 0 {
        if disp + rem as i64 <= max {
            disp += rem as i64;
            off -= rem;
        } else {
            let up = divisor - rem;
            disp -= up as i64;
            off = off.checked_add(up).filter(|off| *off <= mask)?;
        }
    }
    Some((off / divisor, disp))
}

/// Finds base/index/displacement values such that the operand's offset equals `target`.
///
/// `next_ip` is the address of the following instruction, used by RIP-relative forms. Random
/// choices (displacements, free index values) come from `rng`.
pub fn solve<R: Rng + ?Sized>(
    shape: &AddressShape,
    target: u64,
    next_ip: u64,
    rng: &mut R,
) -> Result<AddressSolution, AddressSkip> {
    let mask = size_mask(shape.addr_bytes);
    let target = target & mask;
    let scale = u64::from(shape.scale.max(1));

    if shape.rip_relative {
        let delta = target.wrapping_sub(next_ip) & mask;
        if !fits_disp(delta, 4, shape.addr_bytes) {
            return Err(AddressSkip::RipRelativeOutOfRange);
        }
        return Ok(AddressSolution {
            disp: sign_extend(delta, 4),
            ..AddressSolution::default()
        });
    }

    match (shape.base, shape.index) {
        (Some(base), Some(index)) if base == index => {
            let (value, disp) = split_with_disp(target, scale + 1, shape.disp_size, mask, rng)
                .ok_or(AddressSkip::SameBaseIndexRemainder)?;
            Ok(AddressSolution {
                base_value: value,
                index_value: value,
                disp,
            })
        }
        (Some(_), index) => {
            let disp = random_disp(rng, shape.disp_size);
            let mut rest = target.wrapping_sub(disp as u64);
            let mut index_value = 0;
            if index.is_some() {
                index_value = rng.gen::<u64>() & mask;
                rest = rest.wrapping_sub(index_value.wrapping_mul(scale));
            }
            Ok(AddressSolution {
                base_value: rest & mask,
                index_value,
                disp,
            })
        }
        (None, Some(_)) => {
            let (value, disp) = split_with_disp(target, scale, shape.disp_size, mask, rng)
                .ok_or(AddressSkip::OnlyIndexRemainder)?;
            Ok(AddressSolution {
                base_value: 0,
                index_value: value,
                disp,
            })
        }
        (None, None) => {
            if !fits_disp(target, shape.disp_size, shape.addr_bytes) {
                return Err(AddressSkip::DirectAddressingOverflow);
            }
            Ok(AddressSolution {
                disp: sign_extend(target, shape.disp_size),
                ..AddressSolution::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shape(base: Option<u8>, index: Option<u8>, scale: u8, disp_size: u8) -> AddressShape {
        AddressShape {
            base,
            index,
            scale,
            disp_size,
            rip_relative: false,
            addr_bytes: 4,
        }
    }

    #[test]
    fn same_base_index_without_disp_needs_divisible_target() {
        let mut rng = StdRng::seed_from_u64(7);
        // [eax+eax*2]: effective scale 3.
        let s = shape(Some(0), Some(0), 2, 0);
        assert_eq!(
            solve(&s, 0x1001, 0, &mut rng),
            Err(AddressSkip::SameBaseIndexRemainder)
        );
        let sol = solve(&s, 0x1002, 0, &mut rng).unwrap();
        assert_eq!(sol.base_value, 0x1002 / 3);
        assert_eq!(sol.effective_offset(&s, 0), 0x1002);
    }

    #[test]
    fn same_base_index_absorbs_remainder_into_disp8() {
        let mut rng = StdRng::seed_from_u64(3);
        let s = shape(Some(3), Some(3), 8, 1);
        for target in 0x2000..0x2040 {
            let sol = solve(&s, target, 0, &mut rng).unwrap();
            assert!((-128..=127).contains(&sol.disp));
            assert_eq!(sol.effective_offset(&s, 0), target);
        }
    }

    #[test]
    fn index_only_remainder_uses_modulo_of_scale() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = shape(None, Some(1), 4, 0);
        assert_eq!(
            solve(&s, 0x1006, 0, &mut rng),
            Err(AddressSkip::OnlyIndexRemainder)
        );
        let s = shape(None, Some(1), 8, 4);
        let sol = solve(&s, 0x1006, 0, &mut rng).unwrap();
        assert_eq!(sol.effective_offset(&s, 0), 0x1006);
    }

    #[test]
    fn rip_relative_beyond_2gib_is_skipped() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = AddressShape {
            base: None,
            index: None,
            scale: 1,
            disp_size: 4,
            rip_relative: true,
            addr_bytes: 8,
        };
        let next_ip = 0x7000_0000_1000;
        assert_eq!(
            solve(&s, 0x3000, next_ip, &mut rng),
            Err(AddressSkip::RipRelativeOutOfRange)
        );
        let sol = solve(&s, next_ip - 0x8000_0000, next_ip, &mut rng).unwrap();
        assert_eq!(sol.disp, -0x8000_0000);
        assert_eq!(
            solve(&s, next_ip + 0x8000_0000, next_ip, &mut rng),
            Err(AddressSkip::RipRelativeOutOfRange)
        );
    }

    #[test]
    fn direct_addressing_range_depends_on_address_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = shape(None, None, 1, 4);
        // disp32 covers all of a 32-bit address space.
        assert!(solve(&s, 0xffff_f000, 0, &mut rng).is_ok());

        s.addr_bytes = 8;
        assert_eq!(
            solve(&s, 0x1_0000_0000, 0, &mut rng),
            Err(AddressSkip::DirectAddressingOverflow)
        );
        let sol = solve(&s, 0xffff_ffff_ffff_f000, 0, &mut rng).unwrap();
        assert_eq!(sol.disp, -0x1000);
    }
}
