//! Order and callback state machines.

use serde::{Serialize, Serializer};

/// An order's payment state. Transitions are monotonic: PENDING may move to
/// PAID or EXPIRED; both of those are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OrderStatus {
    Pending,
    Paid,
    Expired,
}

impl OrderStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Paid => 1,
            Self::Expired => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Paid),
            2 => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The human-readable form returned by the status endpoint.
    pub fn as_text(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Expired => "expired",
        }
    }
}

impl Serialize for OrderStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

/// The merchant-notification state of a PAID order.
///
/// `None` orders have never been notified; `InFlight` covers both "attempt
/// running" and "waiting for the next scheduled retry"; `Ok` and `Failed`
/// are reached on a literal `success` reply or on retry exhaustion. Manual
/// re-notify can move a `Failed` order back through the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CallbackStatus {
    None,
    Ok,
    Failed,
    InFlight,
}

impl CallbackStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Ok => 1,
            Self::Failed => 2,
            Self::InFlight => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Ok),
            2 => Some(Self::Failed),
            3 => Some(Self::InFlight),
            _ => None,
        }
    }
}
