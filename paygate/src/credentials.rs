//! Credential resolution: which operator wallet a merchant's new orders
//! observe, and the key material needed to query it.

use paygate_core::ids::{CredentialId, MerchantId};
use paygate_store::{Credential, Store};

/// Everything an engine needs to talk to (or about) one operator wallet.
#[derive(Clone, Debug)]
pub struct CredentialBundle {
    pub credential_id: CredentialId,
    /// Static payee QR code URL handed to buyers.
    pub qrcode_url: String,
    pub app_id: String,
    pub public_key: String,
    pub private_key: String,
}

impl From<Credential> for CredentialBundle {
    fn from(row: Credential) -> Self {
        Self {
            credential_id: row.id,
            qrcode_url: row.qrcode_url,
            app_id: row.app_id,
            public_key: row.public_key,
            private_key: row.private_key,
        }
    }
}

#[derive(Clone)]
pub struct CredentialResolver {
    store: Store,
}

impl CredentialResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The bundle new orders of this merchant bind to: newest active wins.
    /// `None` if the merchant has no active credential.
    pub fn resolve_for_merchant(
        &self,
        merchant_id: MerchantId,
    ) -> anyhow::Result<Option<CredentialBundle>> {
        Ok(self
            .store
            .active_credential_for_merchant(merchant_id)?
            .map(CredentialBundle::from))
    }

    /// The bundle an existing order is bound to. Orders keep their original
    /// credential for life; rotation only affects new orders.
    pub fn bundle_by_id(
        &self,
        credential_id: CredentialId,
    ) -> anyhow::Result<Option<CredentialBundle>> {
        Ok(self
            .store
            .credential_by_id(credential_id)?
            .map(CredentialBundle::from))
    }
}
