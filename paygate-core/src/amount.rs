//! A currency amount newtype which maintains some useful internal invariants.
//!
//! The gateway reconciles payments by comparing wallet balance deltas against
//! order amounts, so amounts must behave exactly like the wallet's: fixed
//! two-decimal-place values with no floating drift. [`Amount`] enforces that
//! shape at construction and provides a lossless integer-cents view for the
//! reconciler's arithmetic.
//!
//! ### Parsing [`Amount`]s
//!
//! Merchant-provided money strings go through [`Amount::from_str`], which
//! parses with [`Decimal`] and rounds half-up to two decimal places (the
//! merchant protocol stringifies amounts with exactly two decimals, but we
//! accept sloppier input the way the upstream gateways do).
//!
//! ### [`Display`]ing [`Amount`]s
//!
//! The [`Display`] impl always renders two decimal places ("20.00", not
//! "20"), which is the canonical form used in signatures, notify payloads,
//! and API responses. Serde uses the same string form in both directions.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("amount is negative")]
    Negative,
    #[error("amount is too large")]
    TooLarge,
    #[error("amount has sub-cent precision")]
    SubCent,
    #[error("amount is not a number")]
    NotANumber,
}

/// A non-negative currency amount with exactly two decimal places.
///
/// Invariants:
///
/// - The contained value is non-negative.
/// - The contained value is no greater than [`Amount::MAX`].
/// - The contained value has no sub-cent component, so conversions to and
///   from integer cents are exact.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Amount(Decimal);

impl Amount {
    /// The maximum [`Amount`] this type can represent. Far beyond anything a
    /// personal wallet balance endpoint will ever report, but small enough
    /// that sums of any realistic order set cannot overflow `i64` cents.
    pub const MAX: Self = Self(dec!(9_999_999_999.99));

    /// Zero, rendered as "0.00".
    pub const ZERO: Self = Self(dec!(0.00));

    /// One cent, the adjustment ladder's step size.
    pub const CENT: Self = Self(dec!(0.01));

    // --- Constructors --- //

    /// Construct an [`Amount`] from a [`Decimal`] which must already be an
    /// exact multiple of 0.01.
    pub fn try_from_decimal(value: Decimal) -> Result<Self, Error> {
        let cents = value * dec!(100);
        if cents != cents.trunc() {
            return Err(Error::SubCent);
        }
        Self::try_from_inner(value)
    }

    /// Construct an [`Amount`] from a signed integer cents value.
    pub fn try_from_cents(cents: i64) -> Result<Self, Error> {
        Self::try_from_inner(Decimal::from(cents) / dec!(100))
    }

    // --- Getters --- //

    /// The amount in integer cents. Exact by the two-decimal invariant.
    pub fn cents(&self) -> i64 {
        (self.0 * dec!(100))
            .to_i64()
            .expect("Sub-cent-free and bounded by Amount::MAX")
    }

    /// The amount as a raw [`Decimal`].
    pub fn to_decimal(&self) -> Decimal {
        self.0
    }

    /// Round an arbitrary [`Decimal`] to cents (half-up) and convert.
    ///
    /// This is the conversion applied to wallet balance readings before any
    /// delta arithmetic, mirroring the round-on-multiply-by-100 rule.
    pub fn round_from_decimal(value: Decimal) -> Result<Self, Error> {
        let rounded = value
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Self::try_from_inner(rounded)
    }

    // --- Checked arithmetic --- //

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_add(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    /// Checks all internal invariants, returning [`Self`] if all were OK.
    fn try_from_inner(inner: Decimal) -> Result<Self, Error> {
        if inner.is_zero() {
            // Collapse "-0" and friends to the canonical zero.
            Ok(Self::ZERO)
        } else if inner.is_sign_negative() {
            Err(Error::Negative)
        } else if inner > Self::MAX.0 {
            Err(Error::TooLarge)
        } else {
            // Normalize to scale 2 so Display always prints two decimals.
            let mut inner = inner;
            inner.rescale(2);
            Ok(Self(inner))
        }
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal =
            Decimal::from_str(s.trim()).map_err(|_| Error::NotANumber)?;
        Self::round_from_decimal(decimal)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The inner Decimal is always rescaled to 2, so the plain Display
        // impl renders the canonical "x.yz" form.
        Decimal::fmt(&self.0, f)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Decimal's visitor accepts both JSON numbers and strings, which
        // covers our own API ("20.00") and wallet gateway responses.
        let inner: Decimal = Deserialize::deserialize(deserializer)?;
        Self::round_from_decimal(inner).map_err(serde::de::Error::custom)
    }
}

// --- Tests and test infra --- //

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0i64..=Amount::MAX.cents())
                .prop_map(|cents| {
                    Amount::try_from_cents(cents).expect("in range")
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn parse_and_render() {
        let amount = Amount::from_str("20").unwrap();
        assert_eq!(amount.to_string(), "20.00");
        assert_eq!(amount.cents(), 2000);

        let amount = Amount::from_str("0.1").unwrap();
        assert_eq!(amount.to_string(), "0.10");
        assert_eq!(amount.cents(), 10);

        // Sub-cent input rounds half-up at the parse boundary.
        assert_eq!(Amount::from_str("1.005").unwrap().cents(), 101);
        assert_eq!(Amount::from_str("1.004").unwrap().cents(), 100);

        assert_eq!(Amount::from_str("abc"), Err(Error::NotANumber));
        assert_eq!(Amount::from_str("-1.00"), Err(Error::Negative));
    }

    #[test]
    fn strict_decimal_constructor_rejects_sub_cent() {
        assert_eq!(
            Amount::try_from_decimal(dec!(1.005)),
            Err(Error::SubCent)
        );
        assert_eq!(
            Amount::try_from_decimal(dec!(1.01)).unwrap().cents(),
            101
        );
    }

    #[test]
    fn cents_roundtrip() {
        proptest!(|(amount in any::<Amount>())| {
            let cents = amount.cents();
            let roundtrip = Amount::try_from_cents(cents).unwrap();
            prop_assert_eq!(amount, roundtrip);
        })
    }

    #[test]
    fn serde_string_roundtrip() {
        proptest!(|(amount in any::<Amount>())| {
            let json = serde_json::to_string(&amount).unwrap();
            let roundtrip: Amount = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(amount, roundtrip);
        })
    }

    #[test]
    fn deserializes_from_json_numbers() {
        let amount: Amount = serde_json::from_str("1010.5").unwrap();
        assert_eq!(amount.to_string(), "1010.50");
    }

    #[test]
    fn checked_arithmetic() {
        let a = Amount::from_str("1.50").unwrap();
        let b = Amount::from_str("0.75").unwrap();
        assert_eq!(a.checked_add(b).unwrap().cents(), 225);
        assert_eq!(a.checked_sub(b).unwrap().cents(), 75);
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(Amount::MAX.checked_add(Amount::CENT), None);
    }
}
