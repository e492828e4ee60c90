//! The periodic expiry sweeper: the safety net behind per-order pollers.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use paygate_tokio::shutdown::ShutdownChannel;
use tracing::{info, warn};

use crate::{order::OrderEngine, reconcile::Reconciler};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Expire overdue PENDING orders every minute; whenever anything actually
/// expired, let the surviving siblings re-baseline.
pub async fn run(
    engine: OrderEngine,
    reconciler: Arc<Reconciler>,
    mut shutdown: ShutdownChannel,
) {
    info!("expiry sweeper started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            () = tokio::time::sleep(SWEEP_INTERVAL) => (),
        }

        match engine.expire_sweep(Utc::now()) {
            Ok(0) => (),
            Ok(expired) => {
                info!(expired, "expiry sweep flipped orders");
                if let Err(e) = reconciler.rebase_after_expiry().await {
                    warn!("post-sweep rebase failed: {e:#}");
                }
            }
            Err(e) => warn!("expiry sweep failed: {e:#}"),
        }
    }
    info!("expiry sweeper stopped");
}
