//! The balance-delta reconciliation engine.
//!
//! One observed balance change on a credential is attributed to one or more
//! of that credential's PENDING orders by subset-sum over integer cents:
//! amount uniqueness (plus the preference for the smallest subset) makes
//! the attribution sound. A successful match flips the orders to PAID,
//! credits the merchants, writes the audit log, and hands the order ids to
//! the callback dispatcher.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use anyhow::Context;
use chrono::Utc;
use paygate_core::{
    amount::Amount,
    ids::{CredentialId, OrderId},
    status::OrderStatus,
};
use paygate_store::Store;
use tracing::{info, warn};

use crate::{
    credentials::CredentialResolver, locks::CredentialLocks,
    wallet::BalanceQuery,
};

/// Consecutive wallet-query failures on one credential before we emit the
/// operator-visible warning.
pub const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// One-way interface from the reconciler to the callback machinery: the
/// reconciler hands over matched order ids and knows nothing else about
/// merchant-side delivery.
pub trait CallbackDispatcher: Send + Sync {
    /// Enqueue notifications for freshly paid orders. Best-effort; must not
    /// block and must not fail the payment that triggered it.
    fn dispatch(&self, order_ids: Vec<OrderId>);
}

/// Per-credential consecutive wallet-failure counters. Owned by the
/// reconciler, constructed by the wiring layer.
#[derive(Default)]
pub struct FailureCounters {
    inner: StdMutex<HashMap<CredentialId, u32>>,
}

impl FailureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; returns the new consecutive count.
    fn record_failure(&self, id: CredentialId) -> u32 {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let count = map.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&self, id: CredentialId) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(&id);
    }

    pub fn count(&self, id: CredentialId) -> u32 {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&id).copied().unwrap_or(0)
    }
}

pub struct Reconciler {
    store: Store,
    resolver: CredentialResolver,
    wallet: Arc<dyn BalanceQuery>,
    locks: CredentialLocks,
    dispatcher: Arc<dyn CallbackDispatcher>,
    failures: FailureCounters,
}

impl Reconciler {
    pub fn new(
        store: Store,
        resolver: CredentialResolver,
        wallet: Arc<dyn BalanceQuery>,
        locks: CredentialLocks,
        dispatcher: Arc<dyn CallbackDispatcher>,
        failures: FailureCounters,
    ) -> Self {
        Self {
            store,
            resolver,
            wallet,
            locks,
            dispatcher,
            failures,
        }
    }

    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    /// Re-evaluate the order's credential group against the wallet balance.
    /// Returns whether `trade_no` itself is (now) paid.
    ///
    /// A transient wallet error never marks anything paid; it is logged to
    /// the balance audit trail and reported as "no match this round".
    pub async fn check_payment(&self, trade_no: &str) -> anyhow::Result<bool> {
        let Some(order) = self.store.order_by_trade_no(trade_no)? else {
            info!(%trade_no, "reconcile: order not found");
            return Ok(false);
        };
        match order.status {
            OrderStatus::Paid => return Ok(true),
            OrderStatus::Expired => return Ok(false),
            OrderStatus::Pending => (),
        }

        let credential_id = order.credential_id;
        // Serialise with concurrent reconciliations, creates, and rebases
        // on this credential. Either racer may observe the match.
        let lock = self.locks.for_credential(credential_id);
        let _guard = lock.lock().await;

        // The race we just serialised may have paid or expired the order
        // while we waited on the lock.
        match self.store.order_status(trade_no)? {
            Some(OrderStatus::Pending) => (),
            Some(OrderStatus::Paid) => return Ok(true),
            Some(OrderStatus::Expired) | None => return Ok(false),
        }

        let current_balance = match self.query_balance(credential_id).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(%trade_no, "balance query failed, skipping round: {e:#}");
                self.store.append_balance_log(
                    Amount::ZERO,
                    &format!("query failure: {e:#}"),
                    None,
                )?;
                return Ok(false);
            }
        };

        let pending =
            self.store.pending_orders_for_credential(credential_id)?;
        let Some(earliest) = pending.first() else {
            info!(%trade_no, "reconcile: no pending orders");
            self.store.append_balance_log(
                current_balance,
                "no pending orders",
                None,
            )?;
            return Ok(false);
        };

        // Delta against the earliest sibling's baseline, in integer cents.
        let delta_cents =
            current_balance.cents() - earliest.base_balance.cents();
        info!(
            %trade_no,
            balance = %current_balance,
            base = %earliest.base_balance,
            delta_cents,
            pending = pending.len(),
            credential = %credential_id,
            "reconcile round"
        );
        if delta_cents <= 0 {
            self.store.append_balance_log(
                current_balance,
                &format!("no match: delta_cents={delta_cents} (no positive change)"),
                None,
            )?;
            return Ok(false);
        }

        let candidate_cents =
            pending.iter().map(|o| o.money.cents()).collect::<Vec<_>>();
        let Some(matched_indices) =
            subset_sum_min(&candidate_cents, delta_cents)
        else {
            let total_cents: i64 = candidate_cents.iter().sum();
            self.store.append_balance_log(
                current_balance,
                &format!(
                    "no match: delta_cents={delta_cents}, \
                     pending_total_cents={total_cents}"
                ),
                None,
            )?;
            return Ok(false);
        };

        let matched_ids = matched_indices
            .iter()
            .map(|&i| pending[i].id)
            .collect::<Vec<_>>();
        let matched_trade_nos = matched_indices
            .iter()
            .map(|&i| pending[i].trade_no.as_str().to_owned())
            .collect::<Vec<_>>();
        let matched_cents: i64 =
            matched_indices.iter().map(|&i| candidate_cents[i]).sum();

        let confirmed =
            self.store
                .confirm_paid(&matched_ids, current_balance, Utc::now())?;

        let trade_nos_joined = matched_trade_nos.join(",");
        info!(
            delta_cents,
            matched_cents,
            matched = %trade_nos_joined,
            "reconcile matched"
        );
        self.store.append_balance_log(
            current_balance,
            &format!("matched: delta_cents={delta_cents}, sum_cents={matched_cents}"),
            Some(&trade_nos_joined),
        )?;

        // Best-effort: a dispatch hiccup must not roll back the payment.
        self.dispatcher.dispatch(confirmed);

        Ok(matched_trade_nos.iter().any(|t| t == trade_no))
    }

    /// Re-snapshot `base_balance` for every credential group that still has
    /// PENDING orders. Called after orders leave PENDING via expiry, when
    /// the survivors' baselines have gone stale. A failing group is skipped
    /// and retried on the next cycle.
    pub async fn rebase_after_expiry(&self) -> anyhow::Result<()> {
        for credential_id in self.store.pending_credential_ids()? {
            let lock = self.locks.for_credential(credential_id);
            let _guard = lock.lock().await;

            match self.query_balance(credential_id).await {
                Ok(balance) => {
                    let rebased =
                        self.store.rebase_pending(credential_id, balance)?;
                    info!(
                        credential = %credential_id,
                        rebased,
                        new_base = %balance,
                        "rebased pending orders"
                    );
                }
                Err(e) => {
                    warn!(
                        credential = %credential_id,
                        "rebase skipped, balance query failed: {e:#}"
                    );
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Query the wallet under this credential, maintaining the consecutive
    /// failure counter and its alert threshold.
    async fn query_balance(
        &self,
        credential_id: CredentialId,
    ) -> anyhow::Result<Amount> {
        let result = async {
            let bundle = self
                .resolver
                .bundle_by_id(credential_id)?
                .with_context(|| {
                    format!("credential {credential_id} not found")
                })?;
            self.wallet
                .available_balance(&bundle)
                .await
                .map_err(anyhow::Error::from)
        }
        .await;

        match result {
            Ok(balance) => {
                self.failures.reset(credential_id);
                Ok(balance)
            }
            Err(e) => {
                let count = self.failures.record_failure(credential_id);
                if count >= FAILURE_ALERT_THRESHOLD {
                    warn!(
                        credential = %credential_id,
                        consecutive_failures = count,
                        "wallet balance endpoint keeps failing; check \
                         network or credential configuration"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Find the smallest-cardinality subset of `amounts` summing to `target`.
///
/// Depth-first with two prunes: candidates larger than the remaining target
/// are skipped, and branches that cannot beat the best known subset size are
/// abandoned. A size-1 solution stops the search outright. Among equal-size
/// subsets the first one visited wins, which is the lowest index order (the
/// caller passes candidates sorted by creation time).
pub(crate) fn subset_sum_min(
    amounts: &[i64],
    target: i64,
) -> Option<Vec<usize>> {
    fn dfs(
        amounts: &[i64],
        start: usize,
        remaining: i64,
        path: &mut Vec<usize>,
        best: &mut Option<Vec<usize>>,
    ) {
        if remaining == 0 {
            if best.as_ref().is_none_or(|b| path.len() < b.len()) {
                *best = Some(path.clone());
            }
            return;
        }
        if remaining < 0 {
            return;
        }
        // A single-order match cannot be improved.
        if best.as_ref().is_some_and(|b| b.len() == 1) {
            return;
        }
        for i in start..amounts.len() {
            if amounts[i] > remaining {
                continue;
            }
            if best.as_ref().is_some_and(|b| path.len() + 1 >= b.len()) {
                return;
            }
            path.push(i);
            dfs(amounts, i + 1, remaining - amounts[i], path, best);
            path.pop();
        }
    }

    let mut best = None;
    let mut path = Vec::new();
    dfs(amounts, 0, target, &mut path, &mut best);
    best
}
