use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_lending::{
    cli::{Cli, Command, ServeArgs},
    client,
    node::{Node, NodeConfig},
    server::LineServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Send(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let node = Node::start(NodeConfig {
        site: args.site.clone(),
        data_dir: args.data_dir.clone(),
        dispatcher: args.dispatcher_config(),
        seed: args.seed,
        fail_primary_after: args.fail_primary_after,
    })?;

    let listener = TcpListener::bind(args.listen).await?;
    let server = LineServer::new(listener, node.dispatcher().clone());
    let addr = server.local_addr()?;
    info!(site = %node.site(), "lending node listening on {}", addr);

    let result = server.run_until_ctrl_c().await;
    if let Err(err) = &result {
        warn!("line server exited with error: {err:?}");
    }
    node.shutdown().await;
    result
}
