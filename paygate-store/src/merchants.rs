//! Merchant rows and derived counters.

use anyhow::Context;
use chrono::{DateTime, Utc};
use paygate_core::{amount::Amount, ids::MerchantId};
use rusqlite::{OptionalExtension, Row, params};

use crate::{Store, fmt_ts};

#[derive(Clone, Debug)]
pub struct Merchant {
    pub id: MerchantId,
    pub username: String,
    /// 32-hex shared secret used to sign and verify this merchant's traffic.
    pub key: String,
    pub active: bool,
    /// Virtual balance, credited whenever one of the merchant's orders is
    /// matched to a balance delta.
    pub money: Amount,
}

/// Derived order counters for the merchant query endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MerchantCounters {
    pub orders: i64,
    pub order_today: i64,
    pub order_lastday: i64,
}

fn merchant_from_row(row: &Row<'_>) -> rusqlite::Result<Merchant> {
    let money_str: String = row.get("money")?;
    let money = money_str.parse::<Amount>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;
    Ok(Merchant {
        id: MerchantId(row.get("id")?),
        username: row.get("username")?,
        key: row.get("key")?,
        active: row.get::<_, i64>("active")? == 1,
        money,
    })
}

impl Store {
    /// Insert a merchant. Merchant provisioning proper is an admin concern;
    /// this exists for fixtures and operator bootstrap scripts.
    pub fn insert_merchant(
        &self,
        username: &str,
        key: &str,
    ) -> anyhow::Result<Merchant> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO merchants (username, key, active, money, created_at, updated_at)
             VALUES (?1, ?2, 1, '0.00', ?3, ?3)",
            params![username, key, now],
        )
        .context("merchant insert failed")?;
        let id = MerchantId(conn.last_insert_rowid());
        Ok(Merchant {
            id,
            username: username.to_owned(),
            key: key.to_owned(),
            active: true,
            money: Amount::ZERO,
        })
    }

    pub fn get_merchant(
        &self,
        id: MerchantId,
    ) -> anyhow::Result<Option<Merchant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM merchants WHERE id = ?1")
            .context("prepare failed")?;
        stmt.query_row(params![id.0], merchant_from_row)
            .optional()
            .context("merchant query failed")
    }

    /// Soft-activate / deactivate. Merchants are never destroyed.
    pub fn set_merchant_active(
        &self,
        id: MerchantId,
        active: bool,
    ) -> anyhow::Result<()> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE merchants SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, now, id.0],
            )
            .context("merchant update failed")?;
        anyhow::ensure!(changed == 1, "no merchant with id {id}");
        Ok(())
    }

    /// Order counters relative to `now`'s calendar date (UTC).
    pub fn merchant_counters(
        &self,
        id: MerchantId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MerchantCounters> {
        let today = now.date_naive();
        let yesterday = today.pred_opt().context("date underflow")?;
        let conn = self.conn();

        let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| {
            conn.query_row(sql, args, |row| row.get::<_, i64>(0))
                .context("counter query failed")
        };

        let orders = count(
            "SELECT COUNT(*) FROM orders WHERE merchant_id = ?1",
            &[&id.0],
        )?;
        let order_today = count(
            "SELECT COUNT(*) FROM orders
             WHERE merchant_id = ?1 AND substr(created_at, 1, 10) = ?2",
            &[&id.0, &today.to_string()],
        )?;
        let order_lastday = count(
            "SELECT COUNT(*) FROM orders
             WHERE merchant_id = ?1 AND substr(created_at, 1, 10) = ?2",
            &[&id.0, &yesterday.to_string()],
        )?;

        Ok(MerchantCounters {
            orders,
            order_today,
            order_lastday,
        })
    }

    /// Sum of PAID order money in integer cents, straight off the order log.
    /// A cross-check against the credited `money` column, used by tests.
    pub fn paid_total_cents(&self, id: MerchantId) -> anyhow::Result<i64> {
        self.conn()
            .query_row(
                "SELECT COALESCE(SUM(CAST(ROUND(money * 100, 0) AS INTEGER)), 0)
                 FROM orders WHERE merchant_id = ?1 AND status = 1",
                params![id.0],
                |row| row.get(0),
            )
            .context("paid total query failed")
    }
}
