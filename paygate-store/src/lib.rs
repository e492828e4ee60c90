//! SQLite persistence for the paygate gateway.
//!
//! A single [`Store`] owns one SQLite connection in WAL mode behind a mutex:
//! reads are cheap, writes serialise, and the handful of multi-statement
//! operations (the paid flip + merchant credit) run as real transactions.
//! Timestamps are stored as UTC `%Y-%m-%d %H:%M:%S` TEXT, which compares
//! lexicographically in the same order as chronologically; ties within one
//! second are broken by row id (insertion order) in every ordered query.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;

pub mod credentials;
pub mod logs;
pub mod merchants;
pub mod orders;

pub use credentials::Credential;
pub use logs::{BalanceLog, CallbackLog};
pub use merchants::{Merchant, MerchantCounters};
pub use orders::{CallbackRetryRow, NewOrder, Order};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a timestamp in the store's canonical TEXT form.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a timestamp in the store's canonical TEXT form.
pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .with_context(|| format!("bad stored timestamp: {s:?}"))?;
    Ok(naive.and_utc())
}

/// Handle to the gateway's relational store. Clone freely.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`. Any failure here is fatal to
    /// the process: there is no degraded mode without a store.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("could not create store directory {dir:?}")
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("could not open sqlite db at {path:?}"))?;
        Self::from_conn(conn)
    }

    /// An in-memory store, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()
            .context("could not open in-memory sqlite db")?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> anyhow::Result<Self> {
        // journal_mode echoes the resulting mode back as a row.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))
            .context("could not enable WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("could not enable foreign keys")?;
        conn.execute_batch(SCHEMA).context("schema init failed")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoning panic happened mid-statement, never mid-transaction:
        // rusqlite rolls uncommitted transactions back on drop, so the
        // connection itself is still consistent.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS merchants (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT    NOT NULL UNIQUE,
    key         TEXT    NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,
    money       TEXT    NOT NULL DEFAULT '0.00',
    created_at  TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    merchant_id INTEGER NOT NULL REFERENCES merchants(id),
    qrcode_url  TEXT    NOT NULL,
    app_id      TEXT    NOT NULL,
    public_key  TEXT    NOT NULL,
    private_key TEXT    NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_no          TEXT    NOT NULL UNIQUE,
    out_trade_no      TEXT    NOT NULL,
    merchant_id       INTEGER NOT NULL REFERENCES merchants(id),
    credential_id     INTEGER NOT NULL REFERENCES credentials(id),
    type              TEXT    NOT NULL DEFAULT 'alipay',
    name              TEXT    NOT NULL,
    original_money    TEXT    NOT NULL,
    money             TEXT    NOT NULL,
    adjust_amount     TEXT    NOT NULL DEFAULT '0.00',
    status            INTEGER NOT NULL DEFAULT 0,
    notify_url        TEXT,
    return_url        TEXT,
    param             TEXT,
    clientip          TEXT,
    device            TEXT    NOT NULL DEFAULT 'pc',
    channel_id        INTEGER,
    base_balance      TEXT    NOT NULL,
    confirm_balance   TEXT,
    callback_status   INTEGER NOT NULL DEFAULT 0,
    callback_attempts INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT    NOT NULL,
    paid_at           TEXT,
    expired_at        TEXT
);

CREATE TABLE IF NOT EXISTS callback_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id      INTEGER NOT NULL REFERENCES orders(id),
    attempt       INTEGER NOT NULL,
    url           TEXT    NOT NULL,
    http_status   INTEGER,
    response_body TEXT,
    created_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS balance_logs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    available_amount  TEXT NOT NULL,
    match_result      TEXT NOT NULL,
    matched_trade_nos TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_status
    ON orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_merchant_status
    ON orders(merchant_id, status);
CREATE INDEX IF NOT EXISTS idx_orders_out_trade_no
    ON orders(merchant_id, out_trade_no);
CREATE INDEX IF NOT EXISTS idx_orders_created_at
    ON orders(created_at);
CREATE INDEX IF NOT EXISTS idx_callback_logs_order_id
    ON callback_logs(order_id);
CREATE INDEX IF NOT EXISTS idx_balance_logs_created
    ON balance_logs(created_at);

-- Backs the amount-uniqueness invariant: for one credential there are never
-- two PENDING orders with equal money.
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_pending_money
    ON orders(credential_id, money) WHERE status = 0;
";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.conn().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn timestamps_roundtrip_and_sort() {
        let a = parse_ts("2025-06-01 10:00:00").unwrap();
        let b = parse_ts("2025-06-01 10:00:01").unwrap();
        assert!(a < b);
        assert_eq!(fmt_ts(a), "2025-06-01 10:00:00");
    }
}
