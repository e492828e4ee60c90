//! The merchant-facing HTTP surface.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use paygate_store::Store;
use paygate_tokio::{shutdown::ShutdownChannel, task::NamedTask};
use tracing::{info, warn};

use crate::{
    callback::CallbackEngine, credentials::CredentialResolver,
    order::OrderEngine, poll::PollerRegistry, reconcile::Reconciler,
};

/// Shared state behind every handler.
pub struct RouterState {
    pub store: Store,
    pub orders: OrderEngine,
    pub reconciler: Arc<Reconciler>,
    pub pollers: PollerRegistry,
    pub callbacks: Arc<CallbackEngine>,
    pub resolver: CredentialResolver,
}

pub fn router(state: Arc<RouterState>) -> Router<()> {
    Router::new()
        .route("/pay/create", post(pay::create))
        .route("/pay/query", get(pay::query))
        .route("/pay/status/{trade_no}", get(pay::status))
        .route("/pay/page/{trade_no}", get(pay::page))
        .route(
            "/admin/orders/{trade_no}/renotify",
            post(admin::renotify),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `listen_addr` and serve the router until shutdown. Returns the
/// server task and the bound url.
pub fn spawn_server_task(
    listen_addr: SocketAddr,
    router: Router<()>,
    shutdown: ShutdownChannel,
) -> anyhow::Result<(NamedTask<()>, String)> {
    let listener = std::net::TcpListener::bind(listen_addr)
        .with_context(|| format!("could not bind {listen_addr}"))?;
    listener
        .set_nonblocking(true)
        .context("could not set listener non-blocking")?;
    let local_addr = listener
        .local_addr()
        .context("could not read listener address")?;
    let url = format!("http://{local_addr}");
    info!(%url, "http server listening");

    let listener = tokio::net::TcpListener::from_std(listener)
        .context("could not register listener with tokio")?;
    let task = NamedTask::spawn("http-server", async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.recv_owned());
        if let Err(e) = serve.await {
            warn!("http server exited with error: {e:#}");
        }
    });
    Ok((task, url))
}

async fn health() -> axum::Json<paygate_core::models::HealthResponse> {
    axum::Json(paygate_core::models::HealthResponse::ok())
}

mod admin {
    use axum::{
        Json,
        extract::{Path, State},
    };
    use paygate_core::models::{AckResponse, ApiError};
    use tracing::{info, instrument};

    use super::*;

    /// `POST /admin/orders/{trade_no}/renotify`: one immediate notify
    /// attempt, for operator tooling. Allowed while the order is PENDING or
    /// PAID and a notify URL is configured; unknown orders are 404.
    #[instrument(skip_all, name = "(renotify)")]
    pub(super) async fn renotify(
        State(state): State<Arc<RouterState>>,
        Path(trade_no): Path<String>,
    ) -> Result<Json<AckResponse>, ApiError> {
        let delivered = state.callbacks.manual_renotify(&trade_no).await?;
        info!(%trade_no, delivered, "manual re-notify ran");
        if delivered {
            Ok(Json(AckResponse::ok("notify delivered")))
        } else {
            Err(ApiError::client("notify failed; see the callback logs"))
        }
    }
}

mod pay {
    use std::collections::HashMap;

    use axum::{
        Json,
        extract::{Form, Path, Query, State},
    };
    use chrono::Utc;
    use paygate_core::{
        ids::MerchantId,
        models::{
            ApiError, CODE_OK, CreateResponse, MerchantQueryResponse,
            OrderQueryResponse, PayPageOrder, PayPageResponse, StatusResponse,
        },
        sign,
        status::OrderStatus,
    };
    use paygate_store::{Merchant, Order, fmt_ts};
    use serde::Deserialize;
    use tracing::{info, instrument, warn};

    use super::*;
    use crate::order::CreateOrderParams;

    const REQUIRED_CREATE_PARAMS: [&str; 7] = [
        "pid",
        "type",
        "out_trade_no",
        "name",
        "money",
        "sign",
        "sign_type",
    ];

    fn parse_pid(raw: &str) -> Result<MerchantId, ApiError> {
        raw.parse::<MerchantId>()
            .map_err(|_| ApiError::client("invalid merchant id"))
    }

    fn load_merchant(
        store: &Store,
        pid: MerchantId,
    ) -> Result<Merchant, ApiError> {
        store
            .get_merchant(pid)
            .map_err(|e| ApiError::internal(format!("merchant lookup: {e:#}")))?
            .ok_or_else(|| ApiError::client("unknown merchant"))
    }

    /// `POST /pay/create`: validate, verify the signature over the flat
    /// parameter map, create the order, start its poller.
    #[instrument(skip_all, name = "(create)")]
    pub(super) async fn create(
        State(state): State<Arc<RouterState>>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Result<Json<CreateResponse>, ApiError> {
        let missing = REQUIRED_CREATE_PARAMS
            .iter()
            .filter(|key| params.get(**key).is_none_or(String::is_empty))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ApiError::client(format!(
                "missing required parameters: {}",
                missing.join(", "),
            )));
        }

        let pid = parse_pid(&params["pid"])?;
        let merchant = load_merchant(&state.store, pid)?;
        if !merchant.active {
            return Err(ApiError::client("merchant is disabled"));
        }

        // Signature covers every submitted key-value pair, known or not.
        let verified = sign::md5_verify(
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &merchant.key,
            &params["sign"],
        );
        if !verified {
            return Err(ApiError::client("invalid signature"));
        }

        let get_opt = |key: &str| {
            params.get(key).filter(|v| !v.is_empty()).cloned()
        };
        let create_params = CreateOrderParams {
            pid,
            pay_type: params["type"].clone(),
            out_trade_no: params["out_trade_no"].clone(),
            name: params["name"].clone(),
            money: params["money"].clone(),
            notify_url: get_opt("notify_url"),
            return_url: get_opt("return_url"),
            clientip: get_opt("clientip"),
            device: get_opt("device").unwrap_or_else(|| "pc".to_owned()),
            param: get_opt("param"),
            channel_id: get_opt("channel_id")
                .and_then(|raw| raw.parse::<i64>().ok()),
        };

        let (order, qrcode) = state.orders.create_order(create_params).await?;
        state.pollers.spawn(&order.trade_no);
        info!(trade_no = %order.trade_no, "order accepted");

        Ok(Json(CreateResponse {
            code: CODE_OK,
            trade_no: order.trade_no,
            qrcode,
            money: order.money,
        }))
    }

    #[derive(Deserialize)]
    pub(super) struct QueryParams {
        act: Option<String>,
        pid: Option<String>,
        key: Option<String>,
        trade_no: Option<String>,
        out_trade_no: Option<String>,
    }

    /// `GET /pay/query`: merchant-key-authenticated lookups. `act=order`
    /// reconciles a PENDING order inline before answering; `act=query`
    /// returns the merchant snapshot.
    #[instrument(skip_all, name = "(query)")]
    pub(super) async fn query(
        State(state): State<Arc<RouterState>>,
        Query(q): Query<QueryParams>,
    ) -> Result<axum::response::Response, ApiError> {
        use axum::response::IntoResponse;

        let act = q
            .act
            .as_deref()
            .ok_or_else(|| ApiError::client("missing act parameter"))?;

        // This is a lookup, not a mutation: the merchant authenticates with
        // the plaintext key rather than a signature.
        let (pid, key) = match (&q.pid, &q.key) {
            (Some(pid), Some(key)) => (pid, key),
            _ => return Err(ApiError::client("missing pid or key parameter")),
        };
        let pid = parse_pid(pid)?;
        let merchant = load_merchant(&state.store, pid)?;
        if merchant.key != *key {
            return Err(ApiError::client("invalid merchant key"));
        }

        match act {
            "order" => order_query(&state, &merchant, &q)
                .await
                .map(|resp| Json(resp).into_response()),
            "query" => merchant_query(&state, &merchant)
                .map(|resp| Json(resp).into_response()),
            other => {
                Err(ApiError::client(format!("unsupported act: {other}")))
            }
        }
    }

    async fn order_query(
        state: &Arc<RouterState>,
        merchant: &Merchant,
        q: &QueryParams,
    ) -> Result<OrderQueryResponse, ApiError> {
        let order = match (&q.trade_no, &q.out_trade_no) {
            (Some(trade_no), _) => state
                .store
                .order_by_trade_no_for_merchant(trade_no, merchant.id),
            (None, Some(out_trade_no)) => state
                .store
                .order_by_out_trade_no(out_trade_no, merchant.id),
            (None, None) =>
                return Err(ApiError::client(
                    "missing trade_no or out_trade_no parameter",
                )),
        }
        .map_err(|e| ApiError::internal(format!("order lookup: {e:#}")))?;
        let mut order = order.ok_or_else(|| ApiError::client("unknown order"))?;

        // A pending order gets one inline reconciliation so the merchant
        // sees a payment as soon as they ask. Errors degrade to "still
        // pending"; the poller keeps trying.
        if order.status == OrderStatus::Pending {
            match state
                .reconciler
                .check_payment(order.trade_no.as_str())
                .await
            {
                Ok(paid) => {
                    info!(trade_no = %order.trade_no, paid, "inline reconcile");
                    if paid {
                        order = state
                            .store
                            .order_by_trade_no(order.trade_no.as_str())
                            .map_err(|e| {
                                ApiError::internal(format!(
                                    "order re-read: {e:#}"
                                ))
                            })?
                            .ok_or_else(|| {
                                ApiError::internal("order vanished mid-query")
                            })?;
                    }
                }
                Err(e) => {
                    warn!(
                        trade_no = %order.trade_no,
                        "inline reconcile failed: {e:#}"
                    );
                }
            }
        }

        Ok(order_query_response(&order, merchant))
    }

    fn order_query_response(
        order: &Order,
        merchant: &Merchant,
    ) -> OrderQueryResponse {
        OrderQueryResponse {
            code: CODE_OK,
            msg: "success",
            trade_no: order.trade_no.clone(),
            out_trade_no: order.out_trade_no.clone(),
            pay_type: order.pay_type.clone(),
            pid: merchant.id,
            addtime: fmt_ts(order.created_at),
            endtime: order.paid_at.map(fmt_ts).unwrap_or_default(),
            name: order.name.clone(),
            money: order.money,
            status: i64::from(order.status == OrderStatus::Paid),
            param: order.param.clone().unwrap_or_default(),
        }
    }

    fn merchant_query(
        state: &Arc<RouterState>,
        merchant: &Merchant,
    ) -> Result<MerchantQueryResponse, ApiError> {
        let counters = state
            .store
            .merchant_counters(merchant.id, Utc::now())
            .map_err(|e| {
                ApiError::internal(format!("merchant counters: {e:#}"))
            })?;
        Ok(MerchantQueryResponse {
            code: CODE_OK,
            pid: merchant.id,
            key: merchant.key.clone(),
            active: i64::from(merchant.active),
            money: merchant.money,
            orders: counters.orders,
            order_today: counters.order_today,
            order_lastday: counters.order_lastday,
        })
    }

    /// `GET /pay/status/{trade_no}`: stored status only, never reconciles.
    /// The payment page UI polls this.
    #[instrument(skip_all, name = "(status)")]
    pub(super) async fn status(
        State(state): State<Arc<RouterState>>,
        Path(trade_no): Path<String>,
    ) -> Result<Json<StatusResponse>, ApiError> {
        let status = state
            .store
            .order_status(&trade_no)
            .map_err(|e| ApiError::internal(format!("status read: {e:#}")))?
            .ok_or_else(|| ApiError::client("unknown order"))?;
        Ok(Json(StatusResponse::new(trade_no.as_str().into(), status)))
    }

    /// `GET /pay/page/{trade_no}`: the buyer-facing payment page data.
    #[instrument(skip_all, name = "(page)")]
    pub(super) async fn page(
        State(state): State<Arc<RouterState>>,
        Path(trade_no): Path<String>,
    ) -> Result<Json<PayPageResponse>, ApiError> {
        let order = state
            .store
            .order_by_trade_no(&trade_no)
            .map_err(|e| ApiError::internal(format!("order lookup: {e:#}")))?
            .ok_or_else(|| ApiError::client("unknown order"))?;

        let qrcode_url = state
            .resolver
            .bundle_by_id(order.credential_id)
            .map_err(|e| {
                ApiError::internal(format!("credential lookup: {e:#}"))
            })?
            .map(|bundle| bundle.qrcode_url)
            .unwrap_or_default();

        let return_url = match state.callbacks.build_return_url(order.id) {
            Ok(Some(url)) => url,
            Ok(None) => String::new(),
            Err(e) => {
                warn!(%trade_no, "return url build failed: {e:#}");
                order.return_url.clone().unwrap_or_default()
            }
        };

        Ok(Json(PayPageResponse {
            code: CODE_OK,
            order: PayPageOrder {
                trade_no: order.trade_no.clone(),
                name: order.name.clone(),
                money: order.money,
                status: order.status,
                created_at: fmt_ts(order.created_at),
            },
            qrcode_url,
            return_url,
        }))
    }
}
