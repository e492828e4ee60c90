//! The paygate service: a personal payment aggregator gateway.
//!
//! Merchants submit signed orders over HTTP; the gateway hands back a static
//! payee QR code of an operator wallet, adjusts each order to a unique
//! amount, and detects payment by polling the wallet's available balance and
//! attributing balance deltas to outstanding orders via subset-sum
//! reconciliation. Matched orders credit the merchant's virtual balance and
//! trigger signed asynchronous notifications.

pub mod callback;
pub mod cli;
pub mod credentials;
pub mod locks;
pub mod order;
pub mod poll;
pub mod reconcile;
pub mod run;
pub mod server;
pub mod sweep;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

/// User agent presented to the wallet gateway and merchant endpoints.
pub const USER_AGENT: &str =
    concat!("paygate/", env!("CARGO_PKG_VERSION"));
