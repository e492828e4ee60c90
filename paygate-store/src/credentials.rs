//! Operator-wallet credential rows.
//!
//! A credential is the operator-side wallet identity (payee QR URL + RSA
//! key pair + wallet app id) under which incoming money is observed. Keys
//! are stored as opaque text; at-rest encryption is handled outside the
//! gateway core.

use anyhow::Context;
use chrono::Utc;
use paygate_core::ids::{CredentialId, MerchantId};
use rusqlite::{OptionalExtension, Row, params};

use crate::{Store, fmt_ts};

#[derive(Clone, Debug)]
pub struct Credential {
    pub id: CredentialId,
    pub merchant_id: MerchantId,
    pub qrcode_url: String,
    pub app_id: String,
    pub public_key: String,
    pub private_key: String,
    pub active: bool,
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: CredentialId(row.get("id")?),
        merchant_id: MerchantId(row.get("merchant_id")?),
        qrcode_url: row.get("qrcode_url")?,
        app_id: row.get("app_id")?,
        public_key: row.get("public_key")?,
        private_key: row.get("private_key")?,
        active: row.get::<_, i64>("active")? == 1,
    })
}

impl Store {
    pub fn insert_credential(
        &self,
        merchant_id: MerchantId,
        qrcode_url: &str,
        app_id: &str,
        public_key: &str,
        private_key: &str,
    ) -> anyhow::Result<Credential> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO credentials
                 (merchant_id, qrcode_url, app_id, public_key, private_key,
                  active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![merchant_id.0, qrcode_url, app_id, public_key, private_key, now],
        )
        .context("credential insert failed")?;
        let id = CredentialId(conn.last_insert_rowid());
        Ok(Credential {
            id,
            merchant_id,
            qrcode_url: qrcode_url.to_owned(),
            app_id: app_id.to_owned(),
            public_key: public_key.to_owned(),
            private_key: private_key.to_owned(),
            active: true,
        })
    }

    pub fn credential_by_id(
        &self,
        id: CredentialId,
    ) -> anyhow::Result<Option<Credential>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM credentials WHERE id = ?1")
            .context("prepare failed")?;
        stmt.query_row(params![id.0], credential_from_row)
            .optional()
            .context("credential query failed")
    }

    /// The credential used for the merchant's new orders: newest active wins.
    pub fn active_credential_for_merchant(
        &self,
        merchant_id: MerchantId,
    ) -> anyhow::Result<Option<Credential>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM credentials
                 WHERE merchant_id = ?1 AND active = 1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
            )
            .context("prepare failed")?;
        stmt.query_row(params![merchant_id.0], credential_from_row)
            .optional()
            .context("credential query failed")
    }

    pub fn set_credential_active(
        &self,
        id: CredentialId,
        active: bool,
    ) -> anyhow::Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE credentials SET active = ?1 WHERE id = ?2",
                params![active as i64, id.0],
            )
            .context("credential update failed")?;
        anyhow::ensure!(changed == 1, "no credential with id {id}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store_with_merchant() -> (Store, MerchantId) {
        let store = Store::open_in_memory().unwrap();
        let m = store.insert_merchant("alice", "k").unwrap();
        (store, m.id)
    }

    #[test]
    fn newest_active_wins() {
        let (store, mid) = store_with_merchant();
        let c1 = store
            .insert_credential(mid, "https://qr/1", "app1", "pub", "priv")
            .unwrap();
        let c2 = store
            .insert_credential(mid, "https://qr/2", "app2", "pub", "priv")
            .unwrap();

        // Same created_at second; the id tie-break picks the newer row.
        let resolved =
            store.active_credential_for_merchant(mid).unwrap().unwrap();
        assert_eq!(resolved.id, c2.id);

        store.set_credential_active(c2.id, false).unwrap();
        let resolved =
            store.active_credential_for_merchant(mid).unwrap().unwrap();
        assert_eq!(resolved.id, c1.id);

        store.set_credential_active(c1.id, false).unwrap();
        assert!(store.active_credential_for_merchant(mid).unwrap().is_none());
    }
}
