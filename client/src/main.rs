use clap::Parser;
use log::info;
use tokio::io::{stdin, stdout, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay host to connect to
    #[arg(short = 'H', long, default_value = shared::DEFAULT_HOST)]
    host: String,

    /// Relay port
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// WebSocket path on the relay
    #[arg(long, default_value = shared::WS_PATH)]
    ws_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let url = shared::ws_url(&args.host, args.port, &args.ws_path);

    info!("Connecting to: {}", url);
    client::network::run(&url, BufReader::new(stdin()), stdout()).await
}
