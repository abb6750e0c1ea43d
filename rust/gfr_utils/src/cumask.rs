// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CU mask
//!
//! A CuMask holds the set of compute units enabled for one workload on
//! one GPU as a single `u64`, and renders it into the two 32-bit
//! hexadecimal words the hardware masking interface expects.
//!
//! CU indices are 1-based: CU `i` occupies bit `i - 1`, so the low
//! word covers CUs 1..=32 and the high word CUs 33..=64. The MI50
//! exposes 60 CUs; the top four bits of the high word stay clear.
//!
//!```
//!     use gfr_utils::CuMask;
//!     let mut mask = CuMask::new();
//!     mask.set_cu(1).unwrap();
//!     assert!(mask.test_cu(1));
//!     let (lo, hi) = mask.hex_words();
//!     assert_eq!((lo.as_str(), hi.as_str()), ("00000001", "00000000"));
//!```

use anyhow::bail;
use anyhow::Result;
use std::fmt;

/// Highest CU index representable in the 64-bit mask word.
pub const MASK_BITS: u32 = 64;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CuMask {
    mask: u64,
}

impl CuMask {
    /// Build a new empty CuMask.
    pub fn new() -> CuMask {
        CuMask { mask: 0 }
    }

    /// Build a CuMask from 1-based CU indices.
    pub fn from_cus<I>(cus: I) -> Result<CuMask>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut mask = CuMask::new();
        for cu in cus {
            mask.set_cu(cu)?;
        }
        Ok(mask)
    }

    fn check_cu(cu: u32) -> Result<()> {
        if cu < 1 || cu > MASK_BITS {
            bail!("Invalid CU {} passed, valid range is [1, {}]", cu, MASK_BITS);
        }
        Ok(())
    }

    /// Set the bit for a CU. Errors if the index is outside [1, 64].
    pub fn set_cu(&mut self, cu: u32) -> Result<()> {
        Self::check_cu(cu)?;
        self.mask |= 1u64 << (cu - 1);
        Ok(())
    }

    /// Clear the bit for a CU. Errors if the index is outside [1, 64].
    pub fn clear_cu(&mut self, cu: u32) -> Result<()> {
        Self::check_cu(cu)?;
        self.mask &= !(1u64 << (cu - 1));
        Ok(())
    }

    /// Test whether a CU is present. Out-of-range indices are absent.
    pub fn test_cu(&self, cu: u32) -> bool {
        if cu < 1 || cu > MASK_BITS {
            return false;
        }
        self.mask & (1u64 << (cu - 1)) != 0
    }

    /// Count the CUs present in the mask.
    pub fn weight(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Iterate the 1-based CU indices present in the mask, ascending.
    pub fn cus(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=MASK_BITS).filter(|cu| self.test_cu(*cu))
    }

    /// Render the mask as `(low, high)` zero-padded 8-hex-digit words,
    /// low word first as the wire format carries them.
    pub fn hex_words(&self) -> (String, String) {
        let lo = (self.mask & 0xffff_ffff) as u32;
        let hi = (self.mask >> 32) as u32;
        (format!("{:08x}", lo), format!("{:08x}", hi))
    }

    pub fn as_raw(&self) -> u64 {
        self.mask
    }
}

impl fmt::Display for CuMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x}", self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(lo: &str, hi: &str) -> Vec<u32> {
        let lo = u32::from_str_radix(lo, 16).unwrap() as u64;
        let hi = u32::from_str_radix(hi, 16).unwrap() as u64;
        let raw = (hi << 32) | lo;
        (1..=MASK_BITS).filter(|cu| raw & (1u64 << (cu - 1)) != 0).collect()
    }

    #[test]
    fn test_known_words() {
        let mask = CuMask::from_cus([1]).unwrap();
        assert_eq!(mask.hex_words(), ("00000001".to_string(), "00000000".to_string()));

        let mask = CuMask::from_cus([64]).unwrap();
        assert_eq!(mask.hex_words(), ("00000000".to_string(), "80000000".to_string()));

        let mask = CuMask::from_cus(1..=crate::MAX_CUS).unwrap();
        assert_eq!(mask.hex_words(), ("ffffffff".to_string(), "0fffffff".to_string()));
    }

    #[test]
    fn test_words_always_eight_digits() {
        for cus in [vec![], vec![4], vec![33], vec![1, 32, 33, 64]] {
            let (lo, hi) = CuMask::from_cus(cus).unwrap().hex_words();
            assert_eq!(lo.len(), 8);
            assert_eq!(hi.len(), 8);
        }
    }

    #[test]
    fn test_round_trip() {
        let subsets: Vec<Vec<u32>> = vec![
            vec![],
            vec![1],
            vec![60],
            (1..=15).map(|k| k * 4).collect(),
            (1..=60).filter(|cu| cu % 7 == 3).collect(),
            (1..=64).collect(),
        ];
        for cus in subsets {
            let mask = CuMask::from_cus(cus.clone()).unwrap();
            let (lo, hi) = mask.hex_words();
            assert_eq!(decode(&lo, &hi), cus);
            assert_eq!(mask.weight() as usize, cus.len());
            assert_eq!(mask.cus().collect::<Vec<_>>(), cus);
        }
    }

    #[test]
    fn test_out_of_range() {
        assert!(CuMask::new().set_cu(0).is_err());
        assert!(CuMask::new().set_cu(65).is_err());
        assert!(CuMask::from_cus([3, 0]).is_err());
        assert!(!CuMask::new().test_cu(0));
        assert!(!CuMask::new().test_cu(65));
    }

    #[test]
    fn test_set_clear() {
        let mut mask = CuMask::new();
        mask.set_cu(17).unwrap();
        mask.set_cu(42).unwrap();
        assert_eq!(mask.weight(), 2);
        mask.clear_cu(17).unwrap();
        assert!(!mask.test_cu(17));
        assert!(mask.test_cu(42));
        assert_eq!(format!("{}", mask), "0x0000020000000000");
    }
}
