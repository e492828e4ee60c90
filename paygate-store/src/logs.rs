//! Append-only audit tables: callback delivery attempts and balance queries.

use anyhow::Context;
use chrono::{DateTime, Utc};
use paygate_core::{amount::Amount, ids::OrderId};
use rusqlite::params;

use crate::{Store, fmt_ts, parse_ts};

#[derive(Clone, Debug)]
pub struct CallbackLog {
    pub order_id: OrderId,
    pub attempt: i64,
    pub url: String,
    pub http_status: Option<i64>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row per reconciliation query against the wallet, successful or not.
#[derive(Clone, Debug)]
pub struct BalanceLog {
    pub available_amount: Amount,
    pub match_result: String,
    pub matched_trade_nos: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn append_callback_log(
        &self,
        order_id: OrderId,
        attempt: i64,
        url: &str,
        http_status: Option<i64>,
        response_body: Option<&str>,
    ) -> anyhow::Result<()> {
        self.conn()
            .execute(
                "INSERT INTO callback_logs
                     (order_id, attempt, url, http_status, response_body,
                      created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    order_id.0,
                    attempt,
                    url,
                    http_status,
                    response_body,
                    fmt_ts(Utc::now()),
                ],
            )
            .context("callback log insert failed")?;
        Ok(())
    }

    pub fn callback_logs_for_order(
        &self,
        order_id: OrderId,
    ) -> anyhow::Result<Vec<CallbackLog>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT order_id, attempt, url, http_status, response_body,
                        created_at
                 FROM callback_logs WHERE order_id = ?1
                 ORDER BY id ASC",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map(params![order_id.0], |row| {
                let created: String = row.get("created_at")?;
                Ok(CallbackLog {
                    order_id: OrderId(row.get("order_id")?),
                    attempt: row.get("attempt")?,
                    url: row.get("url")?,
                    http_status: row.get("http_status")?,
                    response_body: row.get("response_body")?,
                    created_at: parse_ts(&created).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(std::io::Error::other(e.to_string())),
                        )
                    })?,
                })
            })
            .context("callback log query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("callback log decode failed")
    }

    pub fn append_balance_log(
        &self,
        available_amount: Amount,
        match_result: &str,
        matched_trade_nos: Option<&str>,
    ) -> anyhow::Result<()> {
        self.conn()
            .execute(
                "INSERT INTO balance_logs
                     (available_amount, match_result, matched_trade_nos,
                      created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    available_amount.to_string(),
                    match_result,
                    matched_trade_nos,
                    fmt_ts(Utc::now()),
                ],
            )
            .context("balance log insert failed")?;
        Ok(())
    }

    pub fn balance_logs(&self) -> anyhow::Result<Vec<BalanceLog>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT available_amount, match_result, matched_trade_nos,
                        created_at
                 FROM balance_logs ORDER BY id ASC",
            )
            .context("prepare failed")?;
        let rows = stmt
            .query_map([], |row| {
                let amount_s: String = row.get("available_amount")?;
                let created: String = row.get("created_at")?;
                let conv_err = |e: String| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(std::io::Error::other(e)),
                    )
                };
                Ok(BalanceLog {
                    available_amount: amount_s
                        .parse::<Amount>()
                        .map_err(|e| conv_err(e.to_string()))?,
                    match_result: row.get("match_result")?,
                    matched_trade_nos: row.get("matched_trade_nos")?,
                    created_at: parse_ts(&created)
                        .map_err(|e| conv_err(e.to_string()))?,
                })
            })
            .context("balance log query failed")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("balance log decode failed")
    }
}
