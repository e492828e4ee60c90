//! The order engine: creation, amount uniqueness, trade numbers, expiry.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use paygate_core::{
    amount::Amount,
    error::CreateOrderError,
    ids::{CredentialId, MerchantId, TradeNo},
};
use paygate_store::{NewOrder, Order, Store};
use rand::Rng;
use tracing::{info, warn};

use crate::{
    credentials::CredentialResolver, locks::CredentialLocks,
    wallet::BalanceQuery,
};

/// PENDING orders older than this are expired (and their amounts freed).
pub const ORDER_TTL_MINUTES: i64 = 10;

/// The adjustment ladder: up to 99 cents on top of the requested amount.
const MAX_ADJUST_STEPS: i64 = 100;

const TRADE_NO_ATTEMPTS: usize = 10;

/// Parsed input for [`OrderEngine::create_order`]; the HTTP layer builds
/// this from the validated form.
#[derive(Clone, Debug)]
pub struct CreateOrderParams {
    pub pid: MerchantId,
    pub pay_type: String,
    pub out_trade_no: String,
    pub name: String,
    /// Raw merchant-supplied money string, parsed here so format errors are
    /// an order-engine failure like every other precondition.
    pub money: String,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub clientip: Option<String>,
    pub device: String,
    pub param: Option<String>,
    pub channel_id: Option<i64>,
}

#[derive(Clone)]
pub struct OrderEngine {
    store: Store,
    resolver: CredentialResolver,
    wallet: Arc<dyn BalanceQuery>,
    locks: CredentialLocks,
}

impl OrderEngine {
    pub fn new(
        store: Store,
        resolver: CredentialResolver,
        wallet: Arc<dyn BalanceQuery>,
        locks: CredentialLocks,
    ) -> Self {
        Self {
            store,
            resolver,
            wallet,
            locks,
        }
    }

    /// Create an order: validate the merchant, resolve its credential, pick
    /// a unique adjusted amount, snapshot the wallet balance, and persist.
    /// Returns the order and the credential's payee QR code URL.
    pub async fn create_order(
        &self,
        params: CreateOrderParams,
    ) -> Result<(Order, String), CreateOrderError> {
        let merchant = self
            .store
            .get_merchant(params.pid)?
            .ok_or(CreateOrderError::MerchantMissing)?;
        if !merchant.active {
            return Err(CreateOrderError::MerchantInactive);
        }

        let bundle = self
            .resolver
            .resolve_for_merchant(merchant.id)?
            .ok_or(CreateOrderError::CredentialMissing)?;

        let original_money = params
            .money
            .parse::<Amount>()
            .map_err(|_| CreateOrderError::InvalidAmount)?;
        if original_money < Amount::CENT {
            return Err(CreateOrderError::InvalidAmount);
        }

        // Everything from the uniqueness scan to the insert happens under
        // the credential lock, so two concurrent creates cannot pick the
        // same rung of the ladder. The partial unique index is the backstop.
        let lock = self.locks.for_credential(bundle.credential_id);
        let _guard = lock.lock().await;

        let money =
            self.adjust_amount(bundle.credential_id, original_money)?;
        let adjust_amount = money
            .checked_sub(original_money)
            .expect("adjusted money >= original by construction");

        // Snapshot the credential's current balance as this order's delta
        // zero point. A transient wallet failure falls back to zero; the
        // rebase pass corrects stale baselines later.
        let base_balance =
            match self.wallet.available_balance(&bundle).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(
                        out_trade_no = %params.out_trade_no,
                        "base balance query failed, defaulting to 0: {e:#}"
                    );
                    Amount::ZERO
                }
            };

        let trade_no = self.generate_trade_no()?;
        let order = self.store.insert_order(&NewOrder {
            trade_no,
            out_trade_no: params.out_trade_no,
            merchant_id: merchant.id,
            credential_id: bundle.credential_id,
            pay_type: params.pay_type,
            name: params.name,
            original_money,
            money,
            adjust_amount,
            notify_url: params.notify_url,
            return_url: params.return_url,
            param: params.param,
            clientip: params.clientip,
            device: params.device,
            channel_id: params.channel_id,
            base_balance,
        })?;

        info!(
            trade_no = %order.trade_no,
            money = %order.money,
            base_balance = %order.base_balance,
            "order created"
        );
        Ok((order, bundle.qrcode_url))
    }

    /// The smallest `original + k * 0.01` (k in 0..100) not held by a
    /// PENDING sibling on the same credential.
    fn adjust_amount(
        &self,
        credential_id: CredentialId,
        original: Amount,
    ) -> Result<Amount, CreateOrderError> {
        let base_cents = original.cents();
        let occupied = self
            .store
            .pending_money_for_credential(credential_id)?
            .into_iter()
            .map(|amount| amount.cents())
            .filter(|cents| {
                (base_cents..base_cents + MAX_ADJUST_STEPS).contains(cents)
            })
            .collect::<HashSet<i64>>();

        for step in 0..MAX_ADJUST_STEPS {
            let candidate_cents = base_cents + step;
            if !occupied.contains(&candidate_cents) {
                return Amount::try_from_cents(candidate_cents)
                    .map_err(|_| CreateOrderError::InvalidAmount);
            }
        }
        Err(CreateOrderError::AmountConflict)
    }

    /// `%Y%m%d%H%M%S%6f` + 6 random digits, retried on the (extremely
    /// unlikely) collision.
    fn generate_trade_no(&self) -> Result<TradeNo, CreateOrderError> {
        for _ in 0..TRADE_NO_ATTEMPTS {
            let timestamp = Utc::now().format("%Y%m%d%H%M%S%6f");
            let suffix: u32 = rand::thread_rng().gen_range(0..=999_999);
            let candidate = format!("{timestamp}{suffix:06}");
            if !self.store.trade_no_exists(&candidate)? {
                return Ok(TradeNo::new(candidate));
            }
        }
        Err(CreateOrderError::TradeNoExhausted)
    }

    /// Expire every PENDING order past its TTL. Idempotent; returns the
    /// number of orders flipped.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - Duration::minutes(ORDER_TTL_MINUTES);
        self.store.expire_older_than(cutoff, now)
    }
}
