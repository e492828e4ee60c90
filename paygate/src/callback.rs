//! The callback delivery engine: signed, at-least-once merchant
//! notification with a bounded retry schedule.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use paygate_core::{
    error::RenotifyError,
    ids::OrderId,
    sign::{self, SIGN_TYPE_MD5},
    status::{CallbackStatus, OrderStatus},
};
use paygate_store::{Merchant, Order, Store};
use paygate_tokio::{shutdown::ShutdownChannel, task::NamedTask};
use tracing::{info, warn};

use crate::reconcile::CallbackDispatcher;

/// Wait (seconds) before retry n+1, counted from `paid_at`:
/// attempt 2 at +5s, attempt 3 at +35s, ... attempt 6 at +2195s.
pub const RETRY_INTERVALS_SECS: [i64; 5] = [5, 30, 60, 300, 1800];

/// Six deliveries total: the immediate attempt plus five retries.
pub const MAX_ATTEMPTS: i64 = RETRY_INTERVALS_SECS.len() as i64 + 1;

/// The literal body a merchant must reply to acknowledge a notification.
pub const SUCCESS_BODY: &str = "success";

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry decision cadence.
pub const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(30);

pub struct CallbackEngine {
    store: Store,
    http: reqwest::Client,
}

impl CallbackEngine {
    pub fn new(store: Store) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .expect("Failed to build reqwest Client");
        Self { store, http }
    }

    /// Run one notify attempt for the order, advancing the callback state
    /// machine and appending a CallbackLog row whatever the outcome.
    ///
    /// Success means the merchant's response body, stripped of surrounding
    /// whitespace, is exactly [`SUCCESS_BODY`]. Anything else, including
    /// transport errors and non-2xx statuses, is a failure.
    pub async fn send_notify(&self, order_id: OrderId) -> anyhow::Result<bool> {
        let Some(order) = self.store.order_by_id(order_id)? else {
            warn!(%order_id, "notify skipped: order not found");
            return Ok(false);
        };
        let Some(notify_url) =
            order.notify_url.clone().filter(|url| !url.is_empty())
        else {
            info!(%order_id, "notify skipped: no notify_url");
            return Ok(false);
        };
        let merchant = self
            .store
            .get_merchant(order.merchant_id)?
            .context("order references a missing merchant")?;

        let attempt = order.callback_attempts + 1;
        self.store
            .set_callback_state(order_id, CallbackStatus::InFlight, attempt)?;

        let params = signed_notify_params(&order, &merchant);
        let (http_status, body) =
            match self.http.post(&notify_url).form(&params).send().await {
                Ok(resp) => {
                    let status = i64::from(resp.status().as_u16());
                    let body = resp.text().await.unwrap_or_default();
                    (Some(status), body)
                }
                Err(e) => {
                    warn!(%order_id, attempt, "notify request failed: {e:#}");
                    (None, e.to_string())
                }
            };

        let body = body.trim().to_owned();
        let delivered = body == SUCCESS_BODY;
        self.store.append_callback_log(
            order_id,
            attempt,
            &notify_url,
            http_status,
            Some(&body),
        )?;

        if delivered {
            self.store
                .set_callback_state(order_id, CallbackStatus::Ok, attempt)?;
            info!(%order_id, attempt, "notify delivered");
        } else if attempt >= MAX_ATTEMPTS {
            self.store
                .set_callback_state(order_id, CallbackStatus::Failed, attempt)?;
            warn!(%order_id, attempt, "notify exhausted all attempts");
        } else {
            self.store
                .set_callback_state(order_id, CallbackStatus::InFlight, attempt)?;
        }
        Ok(delivered)
    }

    /// One immediate operator-triggered notify attempt.
    ///
    /// Allowed while the order is PENDING or PAID and has a notify URL.
    /// PENDING re-notify is deliberate: it lets an operator exercise a
    /// merchant's endpoint before any money has moved. The attempt runs
    /// through [`send_notify`], so it advances the callback state machine
    /// and is logged like any scheduled delivery; a FAILED order can be
    /// resurrected this way. Returns whether the merchant acked.
    ///
    /// [`send_notify`]: Self::send_notify
    pub async fn manual_renotify(
        &self,
        trade_no: &str,
    ) -> Result<bool, RenotifyError> {
        let order = self
            .store
            .order_by_trade_no(trade_no)?
            .ok_or(RenotifyError::OrderMissing)?;
        if order.status == OrderStatus::Expired {
            return Err(RenotifyError::OrderExpired);
        }
        if order.notify_url.as_deref().is_none_or(str::is_empty) {
            return Err(RenotifyError::NoNotifyUrl);
        }
        self.send_notify(order.id).await.map_err(RenotifyError::Store)
    }

    /// Whether an order with `attempts` deliveries behind it is due for the
    /// next one: `now - base >= sum(intervals[0..attempts])`.
    pub fn due_for_retry(
        attempts: i64,
        base_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if !(1..=RETRY_INTERVALS_SECS.len() as i64).contains(&attempts) {
            return false;
        }
        let wait_secs: i64 =
            RETRY_INTERVALS_SECS[..attempts as usize].iter().sum();
        (now - base_time).num_seconds() >= wait_secs
    }

    /// One retry-scanner pass at time `now`.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let candidates = self
            .store
            .callback_retry_candidates(RETRY_INTERVALS_SECS.len() as i64)?;
        for row in candidates {
            if !Self::due_for_retry(row.attempts, row.base_time, now) {
                continue;
            }
            if let Err(e) = self.send_notify(row.order_id).await {
                warn!(order_id = %row.order_id, "notify retry failed: {e:#}");
            }
        }
        Ok(())
    }

    /// The periodic retry scanner task.
    pub async fn run_retry_scanner(
        self: Arc<Self>,
        mut shutdown: ShutdownChannel,
    ) {
        info!("callback retry scanner started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                () = tokio::time::sleep(RETRY_SCAN_INTERVAL) => (),
            }
            if let Err(e) = self.scan_once(Utc::now()).await {
                warn!("retry scan failed: {e:#}");
            }
        }
        info!("callback retry scanner stopped");
    }

    /// Append the signed notify parameters to the merchant's return URL,
    /// preserving its existing query. Notify values win on key collision.
    /// `Ok(None)` if the order has no return URL.
    pub fn build_return_url(
        &self,
        order_id: OrderId,
    ) -> anyhow::Result<Option<String>> {
        let Some(order) = self.store.order_by_id(order_id)? else {
            return Ok(None);
        };
        let Some(return_url) =
            order.return_url.clone().filter(|url| !url.is_empty())
        else {
            return Ok(None);
        };
        let merchant = self
            .store
            .get_merchant(order.merchant_id)?
            .context("order references a missing merchant")?;

        let notify_params = signed_notify_params(&order, &merchant);
        let Ok(mut url) = reqwest::Url::parse(&return_url) else {
            // Not something we can splice a query into; hand it back as-is.
            return Ok(Some(return_url));
        };

        // Existing parameters first (overridden in place on collision),
        // then the remaining notify parameters in protocol order.
        let mut merged: Vec<(String, String)> = Vec::new();
        for (key, value) in url.query_pairs() {
            if merged.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let value = notify_params
                .iter()
                .find(|(nk, _)| *nk == key)
                .map(|(_, nv)| nv.clone())
                .unwrap_or_else(|| value.into_owned());
            merged.push((key.into_owned(), value));
        }
        for (key, value) in &notify_params {
            if !merged.iter().any(|(k, _)| k == key) {
                merged.push((key.clone(), value.clone()));
            }
        }

        url.set_query(None);
        url.query_pairs_mut().extend_pairs(&merged);
        Ok(Some(url.to_string()))
    }
}

/// The notify parameter set, signed with the merchant key. Field order is
/// the protocol's conventional order with `sign` last.
fn signed_notify_params(
    order: &Order,
    merchant: &Merchant,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("pid".to_owned(), merchant.id.to_string()),
        ("trade_no".to_owned(), order.trade_no.to_string()),
        ("out_trade_no".to_owned(), order.out_trade_no.clone()),
        ("type".to_owned(), order.pay_type.clone()),
        ("name".to_owned(), order.name.clone()),
        ("money".to_owned(), order.money.to_string()),
        ("trade_status".to_owned(), "TRADE_SUCCESS".to_owned()),
        ("param".to_owned(), order.param.clone().unwrap_or_default()),
        ("sign_type".to_owned(), SIGN_TYPE_MD5.to_owned()),
    ];
    let signature = sign::md5_sign(
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &merchant.key,
    );
    params.push(("sign".to_owned(), signature));
    params
}

/// The production [`CallbackDispatcher`]: fans each matched order out to a
/// detached notify task.
pub struct NotifyDispatcher {
    engine: Arc<CallbackEngine>,
}

impl NotifyDispatcher {
    pub fn new(engine: Arc<CallbackEngine>) -> Self {
        Self { engine }
    }
}

impl CallbackDispatcher for NotifyDispatcher {
    fn dispatch(&self, order_ids: Vec<OrderId>) {
        for order_id in order_ids {
            let engine = self.engine.clone();
            NamedTask::spawn(format!("notify-{order_id}"), async move {
                if let Err(e) = engine.send_notify(order_id).await {
                    warn!(%order_id, "notify dispatch failed: {e:#}");
                }
            })
            .detach();
        }
    }
}
