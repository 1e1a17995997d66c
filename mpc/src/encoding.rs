use std::num::Wrapping;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Element of the share ring. Arithmetic wraps modulo 2^64, which is a multiple
/// of every supported ring size, so reduction is deferred until a value is
/// interpreted as signed.
pub type RingElement = Wrapping<u64>;

/// Tensor of ring elements.
pub type RingTensor = ArrayD<RingElement>;

/// Ring of integers modulo 2^bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ring {
    bits: u32,
}

impl Ring {
    /// Largest supported ring width.
    pub const MAX_BITS: u32 = 64;

    /// Create ring of given width. Width must be in range 2..=64.
    pub fn new(bits: u32) -> Option<Self> {
        (2..=Self::MAX_BITS).contains(&bits).then_some(Self { bits })
    }

    /// Width of ring elements in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn mask(&self) -> u64 {
        if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Canonical representative in range [0; 2^bits).
    pub fn reduce(&self, value: RingElement) -> RingElement {
        Wrapping(value.0 & self.mask())
    }

    /// Reinterpret element as a signed integer centered at zero.
    /// The upper half of the ring represents negative values.
    pub fn to_signed(&self, value: RingElement) -> i64 {
        let shift = 64 - self.bits;
        ((value.0 << shift) as i64) >> shift
    }

    /// Embed signed integer into the ring.
    pub fn from_signed(&self, value: i64) -> RingElement {
        self.reduce(Wrapping(value as u64))
    }

    /// Largest positive value representable by signed interpretation.
    pub fn max_signed(&self) -> i64 {
        (self.mask() >> 1) as i64
    }

    /// Signed floor division of each element by a public positive divisor.
    pub fn floor_div(&self, value: RingElement, divisor: u64) -> RingElement {
        let signed = self.to_signed(value) as i128;
        self.from_signed(signed.div_euclid(divisor as i128) as i64)
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self { bits: 64 }
    }
}

/// Fixed-point encoding of reals as `round(x * base^precision)` in a ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedPointEncoder {
    base: u64,
    precision: u32,
    ring: Ring,
}

impl FixedPointEncoder {
    pub fn new(base: u64, precision: u32, ring: Ring) -> Self {
        Self {
            base,
            precision,
            ring,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    /// Scaling factor `base^precision`.
    /// Configurations are validated so that it cannot overflow.
    pub fn scale(&self) -> u64 {
        self.base.saturating_pow(self.precision)
    }

    /// Encode real value. Values outside of ring range silently wrap.
    pub fn encode(&self, value: f64) -> RingElement {
        let scaled = (value * self.scale() as f64).round() as i128;
        self.ring.reduce(Wrapping(scaled as u64))
    }

    /// Decode ring element into real value.
    pub fn decode(&self, value: RingElement) -> f64 {
        self.ring.to_signed(value) as f64 / self.scale() as f64
    }

    pub fn encode_array(&self, values: &ArrayD<f64>) -> RingTensor {
        values.mapv(|x| self.encode(x))
    }

    pub fn decode_array(&self, values: &RingTensor) -> ArrayD<f64> {
        values.mapv(|x| self.decode(x))
    }
}

impl Default for FixedPointEncoder {
    fn default() -> Self {
        Self::new(2, 16, Ring::default())
    }
}
