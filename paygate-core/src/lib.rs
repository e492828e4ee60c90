//! Core domain types for the paygate payment gateway.
//!
//! Everything in this crate is pure data + logic: currency amounts, ids,
//! order / callback states, the merchant signing protocol, and the wire
//! models of the merchant-facing API. No I/O happens here.

pub mod amount;
pub mod error;
pub mod ids;
pub mod models;
pub mod sign;
pub mod status;
