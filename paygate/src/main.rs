use anyhow::Context;
use paygate::{cli::GatewayArgs, run::Gateway};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    paygate_logger::init();

    let args = GatewayArgs::from_env()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    rt.block_on(async {
        let gateway = Gateway::init(args).await?;
        let spawn_ctrlc_handler = true;
        gateway.run(spawn_ctrlc_handler).await
    })
}
