//! Wire models of the merchant-facing API.
//!
//! Every endpoint replies with JSON. Success envelopes carry `code: 1`;
//! recognised failures carry `code: -1` with a human-readable `msg` at
//! HTTP 200 (the legacy aggregator protocol treats HTTP errors as transport
//! faults only). Programmer faults surface the same envelope at HTTP 500.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    amount::Amount,
    ids::{MerchantId, TradeNo},
    status::OrderStatus,
};

pub const CODE_OK: i64 = 1;
pub const CODE_ERR: i64 = -1;

/// A recognised request failure, rendered as the `{code:-1,msg}` envelope.
#[derive(Debug)]
pub struct ApiError {
    pub msg: String,
    pub status: StatusCode,
}

impl ApiError {
    /// A client fault: bad parameters, unknown merchant, bad signature, ...
    /// Delivered at HTTP 200 per the wire protocol.
    pub fn client(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            status: StatusCode::OK,
        }
    }

    /// A lookup miss on an operator surface, delivered at HTTP 404.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// A programmer / infrastructure fault, delivered at HTTP 500.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": CODE_ERR, "msg": self.msg }));
        (self.status, body).into_response()
    }
}

/// `POST /pay/create` success body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub code: i64,
    pub trade_no: TradeNo,
    /// The operator wallet's static payee QR code URL.
    pub qrcode: String,
    /// The adjusted amount the buyer must pay, as a 2-dp string.
    pub money: Amount,
}

/// `GET /pay/status/{trade_no}` body.
#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub code: i64,
    pub trade_no: TradeNo,
    pub status: OrderStatus,
    pub status_text: &'static str,
}

impl StatusResponse {
    pub fn new(trade_no: TradeNo, status: OrderStatus) -> Self {
        Self {
            code: CODE_OK,
            trade_no,
            status,
            status_text: status.as_text(),
        }
    }
}

/// `GET /pay/query?act=order` body.
#[derive(Clone, Debug, Serialize)]
pub struct OrderQueryResponse {
    pub code: i64,
    pub msg: &'static str,
    pub trade_no: TradeNo,
    pub out_trade_no: String,
    #[serde(rename = "type")]
    pub pay_type: String,
    pub pid: MerchantId,
    /// Creation time, `%Y-%m-%d %H:%M:%S`.
    pub addtime: String,
    /// Payment time, `%Y-%m-%d %H:%M:%S`, empty when unpaid.
    pub endtime: String,
    pub name: String,
    pub money: Amount,
    /// Collapsed to 1 for paid, 0 for everything else, per the legacy
    /// protocol this endpoint speaks.
    pub status: i64,
    pub param: String,
}

/// `GET /pay/query?act=query` body: merchant snapshot + derived counters.
#[derive(Clone, Debug, Serialize)]
pub struct MerchantQueryResponse {
    pub code: i64,
    pub pid: MerchantId,
    pub key: String,
    pub active: i64,
    /// The merchant's virtual balance (credited on every matched order).
    pub money: Amount,
    pub orders: i64,
    pub order_today: i64,
    pub order_lastday: i64,
}

/// Buyer-facing order summary inside [`PayPageResponse`].
#[derive(Clone, Debug, Serialize)]
pub struct PayPageOrder {
    pub trade_no: TradeNo,
    pub name: String,
    pub money: Amount,
    pub status: OrderStatus,
    pub created_at: String,
}

/// `GET /pay/page/{trade_no}` body, rendered by the payment page SPA.
#[derive(Clone, Debug, Serialize)]
pub struct PayPageResponse {
    pub code: i64,
    pub order: PayPageOrder,
    pub qrcode_url: String,
    /// The merchant return URL with signed notify parameters attached,
    /// or the raw return URL if it could not be built. Empty if none.
    pub return_url: String,
}

/// Generic `{code, msg}` acknowledgement for operator actions.
#[derive(Clone, Debug, Serialize)]
pub struct AckResponse {
    pub code: i64,
    pub msg: &'static str,
}

impl AckResponse {
    pub fn ok(msg: &'static str) -> Self {
        Self { code: CODE_OK, msg }
    }
}

/// `GET /health` body.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}
