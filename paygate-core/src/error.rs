//! Domain error taxonomy.
//!
//! Engines return tagged error variants; the HTTP layer pattern-matches and
//! converts each recognised fault to the `{code:-1,msg}` envelope. Store and
//! invariant failures are programmer faults and surface as HTTP 500.

use thiserror::Error;

use crate::models::ApiError;

/// Everything that can go wrong while creating an order. None of these
/// retry; all are reported to the caller.
#[derive(Debug, Error)]
pub enum CreateOrderError {
    #[error("unknown merchant")]
    MerchantMissing,
    #[error("merchant is disabled")]
    MerchantInactive,
    #[error("merchant has no active wallet credential")]
    CredentialMissing,
    #[error("invalid amount")]
    InvalidAmount,
    /// All 100 cent-steps above the requested amount are held by PENDING
    /// siblings on the same credential.
    #[error("busy, retry")]
    AmountConflict,
    #[error("could not allocate a unique trade number")]
    TradeNoExhausted,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<CreateOrderError> for ApiError {
    fn from(err: CreateOrderError) -> Self {
        match err {
            CreateOrderError::Store(e) =>
                ApiError::internal(format!("order create failed: {e:#}")),
            other => ApiError::client(other.to_string()),
        }
    }
}

/// Preconditions of the operator's manual re-notify. The attempt itself is
/// only made once all of these hold.
#[derive(Debug, Error)]
pub enum RenotifyError {
    #[error("unknown order")]
    OrderMissing,
    /// Re-notify is allowed while the order is PENDING or PAID.
    #[error("only pending or paid orders can be notified")]
    OrderExpired,
    #[error("order has no notify url")]
    NoNotifyUrl,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<RenotifyError> for ApiError {
    fn from(err: RenotifyError) -> Self {
        match err {
            missing @ RenotifyError::OrderMissing =>
                ApiError::not_found(missing.to_string()),
            RenotifyError::Store(e) =>
                ApiError::internal(format!("re-notify failed: {e:#}")),
            other => ApiError::client(other.to_string()),
        }
    }
}
