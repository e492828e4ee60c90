//! Order rows and the order lifecycle queries.
//!
//! Money columns are stored as canonical two-decimal TEXT. Equality (the
//! partial unique index backing amount-uniqueness) is exact on that form;
//! anything that needs numeric comparison or arithmetic happens in Rust on
//! [`Amount`] values after the row read.

use anyhow::Context;
use chrono::{DateTime, Utc};
use paygate_core::{
    amount::Amount,
    ids::{CredentialId, MerchantId, OrderId, TradeNo},
    status::{CallbackStatus, OrderStatus},
};
use rusqlite::{OptionalExtension, Row, params};

use crate::{Store, fmt_ts, parse_ts};

#[derive(Clone, Debug)]
pub struct Order {
    pub id: OrderId,
    pub trade_no: TradeNo,
    pub out_trade_no: String,
    pub merchant_id: MerchantId,
    pub credential_id: CredentialId,
    pub pay_type: String,
    pub name: String,
    pub original_money: Amount,
    /// `original_money` plus the uniqueness adjustment; what the buyer pays.
    pub money: Amount,
    pub adjust_amount: Amount,
    pub status: OrderStatus,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub param: Option<String>,
    pub clientip: Option<String>,
    pub device: String,
    pub channel_id: Option<i64>,
    /// Wallet balance snapshot taken at creation; the zero point for the
    /// credential group's delta arithmetic.
    pub base_balance: Amount,
    pub confirm_balance: Option<Amount>,
    pub callback_status: CallbackStatus,
    pub callback_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Input for [`Store::insert_order`]. Status starts PENDING; callback state
/// starts at NONE with zero attempts.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub trade_no: TradeNo,
    pub out_trade_no: String,
    pub merchant_id: MerchantId,
    pub credential_id: CredentialId,
    pub pay_type: String,
    pub name: String,
    pub original_money: Amount,
    pub money: Amount,
    pub adjust_amount: Amount,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub param: Option<String>,
    pub clientip: Option<String>,
    pub device: String,
    pub channel_id: Option<i64>,
    pub base_balance: Amount,
}

/// A PAID order that may be due for another notify attempt.
#[derive(Clone, Debug)]
pub struct CallbackRetryRow {
    pub order_id: OrderId,
    pub attempts: i64,
    /// `coalesce(paid_at, created_at)`; the retry schedule's zero point.
    pub base_time: DateTime<Utc>,
}

fn bad_column(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(e),
    )
}

fn get_amount(row: &Row<'_>, col: &str) -> rusqlite::Result<Amount> {
    let s: String = row.get(col)?;
    s.parse::<Amount>().map_err(bad_column)
}

fn get_amount_opt(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<Amount>> {
    let s: Option<String> = row.get(col)?;
    s.map(|s| s.parse::<Amount>().map_err(bad_column)).transpose()
}

fn get_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(col)?;
    parse_ts(&s).map_err(|e| bad_column(std::io::Error::other(e.to_string())))
}

fn get_ts_opt(
    row: &Row<'_>,
    col: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(col)?;
    s.map(|s| {
        parse_ts(&s).map_err(|e| bad_column(std::io::Error::other(e.to_string())))
    })
    .transpose()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let status_code: i64 = row.get("status")?;
    let status = OrderStatus::from_code(status_code).ok_or_else(|| {
        bad_column(std::io::Error::other(format!(
            "bad order status code {status_code}"
        )))
    })?;
    let cb_code: i64 = row.get("callback_status")?;
    let callback_status = CallbackStatus::from_code(cb_code).ok_or_else(|| {
        bad_column(std::io::Error::other(format!(
            "bad callback status code {cb_code}"
        )))
    })?;

    Ok(Order {
        id: OrderId(row.get("id")?),
        trade_no: TradeNo::new(row.get("trade_no")?),
        out_trade_no: row.get("out_trade_no")?,
        merchant_id: MerchantId(row.get("merchant_id")?),
        credential_id: CredentialId(row.get("credential_id")?),
        pay_type: row.get("type")?,
        name: row.get("name")?,
        original_money: get_amount(row, "original_money")?,
        money: get_amount(row, "money")?,
        adjust_amount: get_amount(row, "adjust_amount")?,
        status,
        notify_url: row.get("notify_url")?,
        return_url: row.get("return_url")?,
        param: row.get("param")?,
        clientip: row.get("clientip")?,
        device: row.get("device")?,
        channel_id: row.get("channel_id")?,
        base_balance: get_amount(row, "base_balance")?,
        confirm_balance: get_amount_opt(row, "confirm_balance")?,
        callback_status,
        callback_attempts: row.get("callback_attempts")?,
        created_at: get_ts(row, "created_at")?,
        paid_at: get_ts_opt(row, "paid_at")?,
        expired_at: get_ts_opt(row, "expired_at")?,
    })
}

impl Store {
    pub fn insert_order(&self, new: &NewOrder) -> anyhow::Result<Order> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO orders
                 (trade_no, out_trade_no, merchant_id, credential_id, type,
                  name, original_money, money, adjust_amount, status,
                  notify_url, return_url, param, clientip, device, channel_id,
                  base_balance, callback_status, callback_attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0,
                     ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0, 0, ?17)",
            params![
                new.trade_no.as_str(),
                new.out_trade_no,
                new.merchant_id.0,
                new.credential_id.0,
                new.pay_type,
                new.name,
                new.original_money.to_string(),
                new.money.to_string(),
                new.adjust_amount.to_string(),
                new.notify_url,
                new.return_url,
                new.param,
                new.clientip,
                new.device,
                new.channel_id,
                new.base_balance.to_string(),
                fmt_ts(now),
            ],
        )
        .context("order insert failed")?;
        let id = OrderId(conn.last_insert_rowid());
        drop(conn);

        self.order_by_id(id)?
            .context("freshly inserted order vanished")
    }

    pub fn order_by_id(&self, id: OrderId) -> anyhow::Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM orders WHERE id = ?1")
            .context("prepare failed")?;
        stmt.query_row(params![id.0], order_from_row)
            .optional()
            .context("order query failed")
    }

    pub fn order_by_trade_no(
        &self,
        trade_no: &str,
    ) -> anyhow::Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM orders WHERE trade_no = ?1")
            .context("prepare failed")?;
        stmt.query_row(params![trade_no], order_from_row)
            .optional()
            .context("order query failed")
    }

    pub fn order_by_trade_no_for_merchant(
        &self,
        trade_no: &str,
        merchant_id: MerchantId,
    ) -> anyhow::Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM orders
                 WHERE trade_no = ?1 AND merchant_id = ?2",
            )
            .context("prepare failed")?;
        stmt.query_row(params![trade_no, merchant_id.0], order_from_row)
            .optional()
            .context("order query failed")
    }

    pub fn order_by_out_trade_no(
        &self,
        out_trade_no: &str,
        merchant_id: MerchantId,
    ) -> anyhow::Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM orders
                 WHERE out_trade_no = ?1 AND merchant_id = ?2
                 ORDER BY id DESC LIMIT 1",
            )
            .context("prepare failed")?;
        stmt.query_row(params![out_trade_no, merchant_id.0], order_from_row)
            .optional()
            .context("order query failed")
    }

    pub fn trade_no_exists(&self, trade_no: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM orders WHERE trade_no = ?1")
            .context("prepare failed")?;
        stmt.query_row(params![trade_no], |_| Ok(()))
            .optional()
            .map(|found| found.is_some())
            .context("trade_no probe failed")
    }

    /// The current payment states (stored only, no side effects).
    pub fn order_status(
        &self,
        trade_no: &str,
    ) -> anyhow::Result<Option<OrderStatus>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT status FROM orders WHERE trade_no = ?1")
            .context("prepare failed")?;
        let code: Option<i64> = stmt
            .query_row(params![trade_no], |row| row.get(0))
            .optional()
            .context("status query failed")?;
        code.map(|code| {
            OrderStatus::from_code(code)
                .with_context(|| format!("bad stored status code {code}"))
        })
        .transpose()
    }

    /// All PENDING money values on one credential. The caller applies any
    /// range filtering; pending sets are small by construction (at most 100
    /// per requested amount).
    pub fn pending_money_for_credential(
        &self,
        credential_id: CredentialId,
    ) -> anyhow::Result<Vec<Amount>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT money FROM orders
                 WHERE status = 0 AND credential_id = ?1",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map(params![credential_id.0], |row| {
                let s: String = row.get(0)?;
                s.parse::<Amount>().map_err(bad_column)
            })
            .context("pending money query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("pending money decode failed")
    }

    /// PENDING orders on one credential, earliest created first.
    pub fn pending_orders_for_credential(
        &self,
        credential_id: CredentialId,
    ) -> anyhow::Result<Vec<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM orders
                 WHERE status = 0 AND credential_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map(params![credential_id.0], order_from_row)
            .context("pending orders query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("pending orders decode failed")
    }

    /// Credentials that currently have at least one PENDING order.
    pub fn pending_credential_ids(&self) -> anyhow::Result<Vec<CredentialId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT credential_id FROM orders WHERE status = 0
                 ORDER BY credential_id ASC",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map([], |row| row.get(0).map(CredentialId))
            .context("pending credentials query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("pending credentials decode failed")
    }

    /// Atomically flip the given orders to PAID and credit their merchants.
    ///
    /// Only rows still PENDING are flipped (`WHERE status = 0` guard), so a
    /// concurrent reconciliation that lost the race contributes nothing.
    /// Returns the ids actually flipped.
    pub fn confirm_paid(
        &self,
        ids: &[OrderId],
        confirm_balance: Amount,
        paid_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<OrderId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let paid_at_s = fmt_ts(paid_at);
        let confirm_s = confirm_balance.to_string();

        let mut conn = self.conn();
        let tx = conn.transaction().context("begin tx failed")?;
        let mut confirmed = Vec::with_capacity(ids.len());

        for &id in ids {
            let changed = tx
                .execute(
                    "UPDATE orders
                     SET status = 1, confirm_balance = ?1, paid_at = ?2
                     WHERE id = ?3 AND status = 0",
                    params![confirm_s, paid_at_s, id.0],
                )
                .context("paid update failed")?;
            if changed != 1 {
                continue;
            }
            confirmed.push(id);

            let (merchant_id, money_s): (i64, String) = tx
                .query_row(
                    "SELECT merchant_id, money FROM orders WHERE id = ?1",
                    params![id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context("paid order re-read failed")?;
            let money = money_s
                .parse::<Amount>()
                .context("bad stored order money")?;

            let balance_s: String = tx
                .query_row(
                    "SELECT money FROM merchants WHERE id = ?1",
                    params![merchant_id],
                    |row| row.get(0),
                )
                .context("merchant balance read failed")?;
            let balance = balance_s
                .parse::<Amount>()
                .context("bad stored merchant balance")?;
            let credited = balance
                .checked_add(money)
                .context("merchant balance overflow")?;
            tx.execute(
                "UPDATE merchants SET money = ?1, updated_at = ?2 WHERE id = ?3",
                params![credited.to_string(), paid_at_s, merchant_id],
            )
            .context("merchant credit failed")?;
        }

        tx.commit().context("paid tx commit failed")?;
        Ok(confirmed)
    }

    /// Expire every PENDING order created before `cutoff`. Idempotent.
    /// Returns the number of rows flipped.
    pub fn expire_older_than(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        self.conn()
            .execute(
                "UPDATE orders SET status = 2, expired_at = ?1
                 WHERE status = 0 AND created_at < ?2",
                params![fmt_ts(now), fmt_ts(cutoff)],
            )
            .context("expiry sweep failed")
    }

    /// Expire one PENDING order (poller timeout / admin cancel path).
    /// Returns whether the order was actually flipped.
    pub fn expire_order(
        &self,
        trade_no: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE orders SET status = 2, expired_at = ?1
                 WHERE trade_no = ?2 AND status = 0",
                params![fmt_ts(now), trade_no],
            )
            .context("order expiry failed")?;
        Ok(changed == 1)
    }

    /// Overwrite `base_balance` for every PENDING order on one credential.
    pub fn rebase_pending(
        &self,
        credential_id: CredentialId,
        new_base: Amount,
    ) -> anyhow::Result<usize> {
        self.conn()
            .execute(
                "UPDATE orders SET base_balance = ?1
                 WHERE status = 0 AND credential_id = ?2",
                params![new_base.to_string(), credential_id.0],
            )
            .context("rebase failed")
    }

    pub fn set_callback_state(
        &self,
        id: OrderId,
        status: CallbackStatus,
        attempts: i64,
    ) -> anyhow::Result<()> {
        self.conn()
            .execute(
                "UPDATE orders SET callback_status = ?1, callback_attempts = ?2
                 WHERE id = ?3",
                params![status.code(), attempts, id.0],
            )
            .context("callback state update failed")?;
        Ok(())
    }

    /// PAID orders that are still in the notify state machine: callback
    /// status in-flight or failed, attempts within the retry budget, and a
    /// notify URL to deliver to.
    pub fn callback_retry_candidates(
        &self,
        max_attempts: i64,
    ) -> anyhow::Result<Vec<CallbackRetryRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, callback_attempts,
                        COALESCE(paid_at, created_at) AS base_time
                 FROM orders
                 WHERE status = 1
                   AND callback_status IN (2, 3)
                   AND callback_attempts >= 1
                   AND callback_attempts <= ?1
                   AND notify_url IS NOT NULL
                   AND notify_url != ''
                 ORDER BY id ASC",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map(params![max_attempts], |row| {
                let base: String = row.get("base_time")?;
                Ok(CallbackRetryRow {
                    order_id: OrderId(row.get("id")?),
                    attempts: row.get("callback_attempts")?,
                    base_time: parse_ts(&base).map_err(|e| {
                        bad_column(std::io::Error::other(e.to_string()))
                    })?,
                })
            })
            .context("retry candidates query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("retry candidates decode failed")
    }
}
