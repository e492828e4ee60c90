//! Per-credential advisory mutexes.
//!
//! Amount adjustment, reconciliation, and rebasing all do read-modify-write
//! cycles over one credential's PENDING set, so each credential gets one
//! async mutex shared by every engine. Different credentials never contend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use paygate_core::ids::CredentialId;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone, Default)]
pub struct CredentialLocks {
    inner: Arc<StdMutex<HashMap<CredentialId, Arc<AsyncMutex<()>>>>>,
}

impl CredentialLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or lazily create) the mutex for one credential. Lock the
    /// returned handle; hold it across the whole read-modify-write.
    pub fn for_credential(&self, id: CredentialId) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(id).or_default().clone()
    }
}
