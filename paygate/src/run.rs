//! Gateway wiring: construct the engines, spawn the static tasks, run
//! until shutdown.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use paygate_store::Store;
use paygate_tokio::{
    shutdown::ShutdownChannel,
    task::{self, NamedTask},
};
use tracing::{info, instrument};

use crate::{
    callback::{CallbackEngine, NotifyDispatcher},
    cli::GatewayArgs,
    credentials::CredentialResolver,
    locks::CredentialLocks,
    order::OrderEngine,
    poll::PollerRegistry,
    reconcile::{FailureCounters, Reconciler},
    server::{self, RouterState},
    sweep,
    wallet::{BalanceQuery, DEFAULT_WALLET_GATEWAY, WalletClient},
};

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));

const SHUTDOWN_TIME_LIMIT: Duration = Duration::from_secs(10);

pub struct Gateway {
    gateway_url: String,
    static_tasks: Vec<NamedTask<()>>,
    shutdown: ShutdownChannel,
}

impl Gateway {
    /// Initialize the gateway. A store-initialisation failure here is
    /// fatal: `main` propagates it and the process exits non-zero.
    #[instrument(skip_all, name = "(gateway)")]
    pub async fn init(args: GatewayArgs) -> anyhow::Result<Self> {
        let listen_addr = args.listen_addr.unwrap_or(DEFAULT_LISTEN_ADDR);
        let db_path = args
            .db_path
            .unwrap_or_else(|| PathBuf::from("data/paygate.db"));
        let wallet_gateway_url = args
            .wallet_gateway_url
            .unwrap_or_else(|| DEFAULT_WALLET_GATEWAY.to_owned());

        let store =
            Store::open(&db_path).context("store initialisation failed")?;
        info!(?db_path, "store ready");

        let wallet: Arc<dyn BalanceQuery> =
            Arc::new(WalletClient::new(wallet_gateway_url));
        let locks = CredentialLocks::new();
        let resolver = CredentialResolver::new(store.clone());
        let callbacks = Arc::new(CallbackEngine::new(store.clone()));
        let dispatcher = Arc::new(NotifyDispatcher::new(callbacks.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            resolver.clone(),
            wallet.clone(),
            locks.clone(),
            dispatcher,
            FailureCounters::new(),
        ));
        let shutdown = ShutdownChannel::new();
        let pollers = PollerRegistry::new(
            store.clone(),
            reconciler.clone(),
            shutdown.clone(),
        );
        let orders = OrderEngine::new(
            store.clone(),
            resolver.clone(),
            wallet,
            locks,
        );

        let mut static_tasks = Vec::with_capacity(3);

        let state = Arc::new(RouterState {
            store: store.clone(),
            orders: orders.clone(),
            reconciler: reconciler.clone(),
            pollers,
            callbacks: callbacks.clone(),
            resolver,
        });
        let (server_task, gateway_url) = server::spawn_server_task(
            listen_addr,
            server::router(state),
            shutdown.clone(),
        )
        .context("could not start http server")?;
        static_tasks.push(server_task);

        static_tasks.push(NamedTask::spawn("expiry-sweeper", {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            sweep::run(orders, reconciler, shutdown)
        }));

        static_tasks.push(NamedTask::spawn("callback-retry-scanner", {
            let shutdown = shutdown.clone();
            callbacks.run_retry_scanner(shutdown)
        }));

        Ok(Self {
            gateway_url,
            static_tasks,
            shutdown,
        })
    }

    /// The bound url, e.g. "http://127.0.0.1:8080".
    pub fn url(&self) -> String {
        self.gateway_url.clone()
    }

    /// A handle that shuts the gateway down when sent.
    pub fn shutdown_channel(&self) -> ShutdownChannel {
        self.shutdown.clone()
    }

    /// Run until a shutdown signal (or Ctrl+C, if enabled) arrives, then
    /// wind the static tasks down within a time limit.
    #[instrument(skip_all, name = "(gateway)")]
    pub async fn run(self, spawn_ctrlc_handler: bool) -> anyhow::Result<()> {
        if spawn_ctrlc_handler {
            NamedTask::spawn("ctrlc-handler", {
                let shutdown = self.shutdown.clone();
                async move {
                    use tokio::signal::ctrl_c;

                    info!("press Ctrl+C to shut down");
                    ctrl_c().await.expect("Error receiving first CTRL+C");
                    info!(
                        "Ctrl+C received, shutting down gracefully; \
                         hit Ctrl+C again to quit immediately"
                    );
                    shutdown.send();
                    ctrl_c().await.expect("Error receiving second CTRL+C");
                    std::process::exit(1);
                }
            })
            .detach();
        }

        task::join_tasks_on_shutdown(
            self.static_tasks,
            self.shutdown,
            SHUTDOWN_TIME_LIMIT,
        )
        .await
        .context("error awaiting gateway tasks")
    }
}
