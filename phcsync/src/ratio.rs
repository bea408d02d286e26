//! Encoding of clock rate ratios for hardware rate registers.
//!
//! Some switches (the NXP SJA1105 family for example) steer their PTP clock
//! through a write-only 32 bit register that holds the clock speed as a
//! multiplier of the nominal rate. Bit 31 is the integer part, bits 30..0 the
//! fraction, so ratios in `(0, 2)` can be expressed.

use fixed::types::U1F31;

const FRACTION_SHIFT: u32 = 21;
const FRACTION_MASK: u64 = 0x7fff_ffff;
const INTEGER_BIT: u32 = 0x8000_0000;

/// A clock rate ratio did not fit the hardware register
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum RangeError {
    /// The ratio is not in the open interval `(0, 2)`
    #[cfg_attr(feature = "std", error("ratio {0} exceeds register range"))]
    Ratio(f64),
    /// The offset measured during bring-up can not be corrected by only adding
    /// time to the hardware clock
    #[cfg_attr(
        feature = "std",
        error("offset of {0}ns can not be corrected by adding time")
    )]
    Offset(i64),
}

/// The 32 bit fixed-point value of a hardware clock rate register
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RatioRegister(u32);

impl RatioRegister {
    /// The register value for a clock running at its nominal rate
    pub const NOMINAL: Self = Self(INTEGER_BIT);

    /// Encode `ratio` into the register layout.
    ///
    /// The 31 fraction bits are taken straight from the mantissa of the double
    /// `ratio` (or `ratio + 1` for ratios below one): for doubles in `[1, 2)`
    /// the top 31 mantissa bits are exactly the fraction. Bits beyond that
    /// precision are truncated.
    ///
    /// # Example
    /// ```
    /// # use phcsync::RatioRegister;
    /// assert_eq!(RatioRegister::encode(1.0).unwrap().bits(), 0x8000_0000);
    /// assert_eq!(RatioRegister::encode(0.75).unwrap().bits(), 0x6000_0000);
    /// assert!(RatioRegister::encode(2.0).is_err());
    /// ```
    pub fn encode(ratio: f64) -> Result<Self, RangeError> {
        // written so NaN is rejected as well
        if !(ratio > 0.0 && ratio < 2.0) {
            return Err(RangeError::Ratio(ratio));
        }

        let normalized = if ratio < 1.0 { ratio + 1.0 } else { ratio };
        let mut bits = ((normalized.to_bits() >> FRACTION_SHIFT) & FRACTION_MASK) as u32;

        if ratio >= 1.0 {
            bits |= INTEGER_BIT;
        }

        Ok(Self(bits))
    }

    /// Interpret a raw register value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The ratio this register value represents
    ///
    /// The register is write-only on hardware, this is the inverse of
    /// [`encode`](Self::encode) up to the 2<sup>-31</sup> truncation.
    pub fn decode(self) -> f64 {
        U1F31::from_bits(self.0).to_num::<f64>()
    }
}

impl Default for RatioRegister {
    fn default() -> Self {
        Self::NOMINAL
    }
}
