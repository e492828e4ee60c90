//! Mocks and fixtures shared by unit and integration tests.

use std::{
    collections::HashMap,
    sync::{Mutex as StdMutex, PoisonError},
};

use async_trait::async_trait;
use paygate_core::{amount::Amount, ids::CredentialId, ids::OrderId};
use paygate_store::{Credential, Merchant, Store};

use crate::{
    credentials::CredentialBundle,
    reconcile::CallbackDispatcher,
    wallet::{BalanceQuery, WalletError},
};

/// A programmable stand-in for the wallet gateway. Each credential has
/// either a balance or an error; unconfigured credentials error, so tests
/// must state what the wallet would say.
#[derive(Default)]
pub struct MockBalanceSource {
    responses: StdMutex<HashMap<CredentialId, Result<Amount, String>>>,
}

impl MockBalanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, id: CredentialId, balance: Amount) {
        self.lock().insert(id, Ok(balance));
    }

    pub fn set_error(&self, id: CredentialId, msg: &str) {
        self.lock().insert(id, Err(msg.to_owned()));
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<CredentialId, Result<Amount, String>>>
    {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BalanceQuery for MockBalanceSource {
    async fn available_balance(
        &self,
        bundle: &CredentialBundle,
    ) -> Result<Amount, WalletError> {
        match self.lock().get(&bundle.credential_id) {
            Some(Ok(balance)) => Ok(*balance),
            Some(Err(msg)) => Err(WalletError::Api {
                code: "mock".to_owned(),
                msg: msg.clone(),
            }),
            None => Err(WalletError::Api {
                code: "mock".to_owned(),
                msg: "no balance configured".to_owned(),
            }),
        }
    }
}

/// Records dispatched order ids instead of delivering anything.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: StdMutex<Vec<OrderId>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything dispatched so far.
    pub fn take(&self) -> Vec<OrderId> {
        std::mem::take(
            &mut *self
                .dispatched
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl CallbackDispatcher for RecordingDispatcher {
    fn dispatch(&self, order_ids: Vec<OrderId>) {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(order_ids);
    }
}

/// One active merchant with one active credential; the standard fixture.
pub fn seed_merchant_with_credential(store: &Store) -> (Merchant, Credential) {
    let merchant = store
        .insert_merchant("merchant1", &"ab".repeat(16))
        .expect("merchant fixture");
    let credential = store
        .insert_credential(
            merchant.id,
            "https://qr.example/payee",
            "2021000000000001",
            "fake-public-key",
            "fake-private-key",
        )
        .expect("credential fixture");
    (merchant, credential)
}
