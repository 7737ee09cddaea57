//! Price and Volume Value Objects

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-negative fixed-point price, quantised to 4 fractional digits with
/// half-up rounding at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    pub const SCALE: u32 = 4;

    pub fn new(value: Decimal) -> Result<Self, PriceError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(PriceError::Negative(value));
        }
        Ok(Self(value.round_dp_with_strategy(
            Self::SCALE,
            RoundingStrategy::MidpointAwayFromZero,
        )))
    }

    pub fn from_f64(value: f64) -> Result<Self, PriceError> {
        let dec = Decimal::from_f64(value).ok_or(PriceError::NotFinite(value))?;
        Self::new(dec)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    #[inline]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Lossy conversion for the Parquet schema (double columns).
    pub fn to_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn checked_add(&self, other: Price) -> Option<Price> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Subtraction saturating at zero is deliberately not offered; a negative
    /// result is an error in this domain.
    pub fn checked_sub(&self, other: Price) -> Result<Price, PriceError> {
        let diff = self.0 - other.0;
        Self::new(diff)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriceError {
    Negative(Decimal),
    NotFinite(f64),
}

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negative(v) => write!(f, "price must be non-negative: {}", v),
            Self::NotFinite(v) => write!(f, "price is not representable: {}", v),
        }
    }
}

impl std::error::Error for PriceError {}

/// Non-negative share volume.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Volume(u64);

impl Volume {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn checked_add(&self, other: Volume) -> Option<Volume> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
