//! The payment poller: one background task per PENDING order driving the
//! reconciler until match, timeout, or cancellation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use paygate_core::{ids::TradeNo, status::OrderStatus};
use paygate_store::Store;
use paygate_tokio::{shutdown::ShutdownChannel, task::NamedTask};
use tracing::{debug, info, warn};

use crate::reconcile::Reconciler;

/// Reconciliation cadence while an order is outstanding.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polling stops (and the order expires) after this long.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Spawns and tracks pollers; one active poller per trade number.
#[derive(Clone)]
pub struct PollerRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    reconciler: Arc<Reconciler>,
    /// Per-order cancellation tokens, keyed by trade number.
    active: StdMutex<HashMap<String, ShutdownChannel>>,
    /// Service-wide shutdown; stops every poller within one tick.
    shutdown: ShutdownChannel,
}

impl PollerRegistry {
    pub fn new(
        store: Store,
        reconciler: Arc<Reconciler>,
        shutdown: ShutdownChannel,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                reconciler,
                active: StdMutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Start polling `trade_no`. A no-op if a poller is already running for
    /// it (re-creation is idempotent).
    pub fn spawn(&self, trade_no: &TradeNo) {
        let cancel = {
            let mut active = self.lock_active();
            if active.contains_key(trade_no.as_str()) {
                debug!(%trade_no, "poller already running");
                return;
            }
            let cancel = ShutdownChannel::new();
            active.insert(trade_no.as_str().to_owned(), cancel.clone());
            cancel
        };

        let registry = self.clone();
        let trade_no = trade_no.clone();
        NamedTask::spawn(format!("poller-{trade_no}"), async move {
            registry.run_poller(trade_no, cancel).await;
        })
        .detach();
    }

    /// Signal the order's poller to stop at its next stop-condition check.
    /// Callers flip the order status themselves; the poller only observes.
    pub fn cancel(&self, trade_no: &str) {
        if let Some(cancel) = self.lock_active().get(trade_no) {
            cancel.send();
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    async fn run_poller(self, trade_no: TradeNo, mut cancel: ShutdownChannel) {
        info!(%trade_no, "poller started");
        let started = tokio::time::Instant::now();
        let mut shutdown = self.inner.shutdown.clone();
        let mut rounds = 0u32;

        loop {
            // Stop conditions, checked before each query.
            if started.elapsed() >= POLL_TIMEOUT {
                info!(%trade_no, rounds, "poll timeout, expiring order");
                self.expire_and_rebase(&trade_no).await;
                break;
            }
            match self.inner.store.order_status(trade_no.as_str()) {
                Ok(Some(OrderStatus::Pending)) => (),
                Ok(Some(status)) => {
                    info!(%trade_no, ?status, "order left PENDING, poller done");
                    break;
                }
                Ok(None) => {
                    warn!(%trade_no, "order disappeared, poller done");
                    break;
                }
                Err(e) => {
                    warn!(%trade_no, "status read failed: {e:#}");
                }
            }

            rounds += 1;
            match self.inner.reconciler.check_payment(trade_no.as_str()).await
            {
                Ok(true) => {
                    info!(%trade_no, rounds, "poller observed payment");
                    break;
                }
                Ok(false) => (),
                Err(e) => warn!(%trade_no, "reconcile round failed: {e:#}"),
            }

            tokio::select! {
                biased;
                () = cancel.recv() => {
                    info!(%trade_no, "poller cancelled");
                    break;
                }
                () = shutdown.recv() => break,
                () = tokio::time::sleep(POLL_INTERVAL) => (),
            }
        }

        self.lock_active().remove(trade_no.as_str());
    }

    /// Timeout path: flip the order to EXPIRED (the `status = 0` guard
    /// keeps this from racing a reconciliation that just paid it), then let
    /// the surviving siblings re-baseline.
    async fn expire_and_rebase(&self, trade_no: &TradeNo) {
        match self.inner.store.expire_order(trade_no.as_str(), Utc::now()) {
            Ok(true) => {
                if let Err(e) =
                    self.inner.reconciler.rebase_after_expiry().await
                {
                    warn!(%trade_no, "post-expiry rebase failed: {e:#}");
                }
            }
            Ok(false) => (),
            Err(e) => warn!(%trade_no, "expiry on timeout failed: {e:#}"),
        }
    }

    fn lock_active(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, ShutdownChannel>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use paygate_core::{amount::Amount, ids::MerchantId};
    use paygate_store::NewOrder;

    use super::*;
    use crate::{
        credentials::CredentialResolver,
        locks::CredentialLocks,
        reconcile::{CallbackDispatcher, FailureCounters},
        testing::{
            MockBalanceSource, RecordingDispatcher,
            seed_merchant_with_credential,
        },
        wallet::BalanceQuery,
    };

    struct Harness {
        store: Store,
        wallet: Arc<MockBalanceSource>,
        registry: PollerRegistry,
        shutdown: ShutdownChannel,
        credential_id: paygate_core::ids::CredentialId,
        merchant_id: MerchantId,
    }

    fn harness() -> Harness {
        let store = Store::open_in_memory().unwrap();
        let (merchant, credential) = seed_merchant_with_credential(&store);
        let wallet = Arc::new(MockBalanceSource::new());
        let reconciler = Arc::new(crate::reconcile::Reconciler::new(
            store.clone(),
            CredentialResolver::new(store.clone()),
            wallet.clone() as Arc<dyn BalanceQuery>,
            CredentialLocks::new(),
            Arc::new(RecordingDispatcher::new()) as Arc<dyn CallbackDispatcher>,
            FailureCounters::new(),
        ));
        let shutdown = ShutdownChannel::new();
        let registry =
            PollerRegistry::new(store.clone(), reconciler, shutdown.clone());
        Harness {
            store,
            wallet,
            registry,
            shutdown,
            credential_id: credential.id,
            merchant_id: merchant.id,
        }
    }

    fn insert_pending(h: &Harness, trade_no: &str) -> TradeNo {
        let trade_no = TradeNo::from(trade_no);
        h.store
            .insert_order(&NewOrder {
                trade_no: trade_no.clone(),
                out_trade_no: format!("out-{trade_no}"),
                merchant_id: h.merchant_id,
                credential_id: h.credential_id,
                pay_type: "alipay".to_owned(),
                name: "widget".to_owned(),
                original_money: "10.00".parse().unwrap(),
                money: "10.00".parse().unwrap(),
                adjust_amount: Amount::ZERO,
                notify_url: None,
                return_url: None,
                param: None,
                clientip: None,
                device: "pc".to_owned(),
                channel_id: None,
                base_balance: "1000.00".parse().unwrap(),
            })
            .unwrap();
        trade_no
    }

    async fn wait_for_no_pollers(registry: &PollerRegistry) {
        for _ in 0..1000 {
            if registry.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pollers never drained");
    }

    #[tokio::test(start_paused = true)]
    async fn poller_observes_payment_and_exits() {
        let h = harness();
        let trade_no = insert_pending(&h, "t1");
        // No balance movement for the first rounds, then the buyer pays.
        h.wallet
            .set_balance(h.credential_id, "1000.00".parse().unwrap());

        h.registry.spawn(&trade_no);
        assert_eq!(h.registry.active_count(), 1);
        // Spawning again is a no-op.
        h.registry.spawn(&trade_no);
        assert_eq!(h.registry.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.wallet
            .set_balance(h.credential_id, "1010.00".parse().unwrap());

        wait_for_no_pollers(&h.registry).await;
        assert_eq!(
            h.store.order_status("t1").unwrap().unwrap(),
            OrderStatus::Paid,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poller_times_out_and_expires() {
        let h = harness();
        let trade_no = insert_pending(&h, "t1");
        h.wallet
            .set_balance(h.credential_id, "1000.00".parse().unwrap());

        h.registry.spawn(&trade_no);
        tokio::time::sleep(POLL_TIMEOUT + Duration::from_secs(5)).await;

        wait_for_no_pollers(&h.registry).await;
        assert_eq!(
            h.store.order_status("t1").unwrap().unwrap(),
            OrderStatus::Expired,
        );
        let order = h.store.order_by_trade_no("t1").unwrap().unwrap();
        assert!(order.expired_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_within_a_tick() {
        let h = harness();
        let trade_no = insert_pending(&h, "t1");
        h.wallet
            .set_balance(h.credential_id, "1000.00".parse().unwrap());

        h.registry.spawn(&trade_no);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Admin cancel: flip the order, then signal the token.
        h.store.expire_order("t1", Utc::now()).unwrap();
        h.registry.cancel("t1");

        wait_for_no_pollers(&h.registry).await;
        assert_eq!(
            h.store.order_status("t1").unwrap().unwrap(),
            OrderStatus::Expired,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn service_shutdown_stops_pollers() {
        let h = harness();
        let trade_no = insert_pending(&h, "t1");
        h.wallet
            .set_balance(h.credential_id, "1000.00".parse().unwrap());

        h.registry.spawn(&trade_no);
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.shutdown.send();

        wait_for_no_pollers(&h.registry).await;
        // The order is untouched; the sweeper is the safety net.
        assert_eq!(
            h.store.order_status("t1").unwrap().unwrap(),
            OrderStatus::Pending,
        );
    }
}
