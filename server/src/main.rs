use anyhow::Context;
use clap::Parser;
use log::info;
use server::hub::{Hub, HubConfig};
use server::network::{serve, ServerConfig};
use std::path::PathBuf;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = shared::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Directory of client files
    #[arg(short, long, default_value = shared::DEFAULT_ASSET_DIR)]
    directory: PathBuf,

    /// Path at which WebSocket upgrades are accepted
    #[arg(long, default_value = shared::WS_PATH)]
    ws_path: String,

    /// Outbound messages buffered per client before it is disconnected
    #[arg(short = 'q', long, default_value_t = shared::OUTBOUND_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Events buffered per hub conduit
    #[arg(long, default_value_t = shared::EVENT_QUEUE_CAPACITY)]
    event_capacity: usize,

    /// Do not send a message back to the client that sent it
    #[arg(long)]
    no_echo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let (hub, handle) = Hub::new(HubConfig {
        event_capacity: args.event_capacity,
        echo_to_sender: !args.no_echo,
    });
    tokio::spawn(hub.run());

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to listen on {}", address))?;
    info!("Started on port {}", args.port);

    let config = ServerConfig {
        asset_dir: args.directory,
        ws_path: args.ws_path,
        queue_capacity: args.queue_capacity,
    };
    serve(listener, config, handle)
        .await
        .context("relay server stopped")?;

    Ok(())
}
