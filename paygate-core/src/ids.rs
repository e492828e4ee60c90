//! Integer id newtypes and the platform trade number.

use std::{
    fmt::{self, Display},
    num::ParseIntError,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                i64::from_str(s).map(Self)
            }
        }
    };
}

int_id!(
    /// A merchant's platform id (the `pid` of the merchant protocol).
    MerchantId
);
int_id!(
    /// An operator-wallet credential id. Orders bound to different
    /// credentials never share a balance and never reconcile together.
    CredentialId
);
int_id!(
    /// An order's row id.
    OrderId
);

/// The platform-assigned order number: a `%Y%m%d%H%M%S%6f` timestamp
/// followed by six random digits, 26 digits total.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeNo(String);

impl TradeNo {
    /// Total digits: 20 timestamp digits + 6 random digits.
    pub const LEN: usize = 26;

    pub fn new(inner: String) -> Self {
        Self(inner)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like a trade number we could have issued.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == Self::LEN
            && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl Display for TradeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TradeNo {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trade_no_well_formedness() {
        let good = TradeNo::from("20250101120000123456654321");
        assert!(good.is_well_formed());
        assert!(!TradeNo::from("hello").is_well_formed());
        assert!(!TradeNo::from("2025010112000012345665432").is_well_formed());
    }

    #[test]
    fn merchant_id_parses() {
        assert_eq!("1001".parse::<MerchantId>().unwrap(), MerchantId(1001));
        assert!("one".parse::<MerchantId>().is_err());
    }
}
