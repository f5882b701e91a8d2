use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use taskrelay_broker::{
    backend::{build_broker, BackendConfig},
    http::server::{run_server, GatewaySettings},
};
use taskrelay_models::errors::SendableError;
use taskrelay_utilities::{retry::FixedBackoff, startup};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "HTTP gateway for taskrelay queues", long_about = None)]
struct GatewayConfig {
    #[command(flatten)]
    backend: BackendConfig,

    #[arg(long, env = "TASKRELAY_GATEWAY_ADDR", default_value = "0.0.0.0:5000")]
    addr: SocketAddr,

    #[arg(long, env = "TASKRELAY_UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    #[arg(long, env = "TASKRELAY_SUBMIT_RETRIES", default_value_t = 3)]
    submit_retries: u32,
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    startup::startup("taskrelay gateway")?;

    let config = GatewayConfig::try_parse()?;
    let broker = build_broker(&config.backend)?;
    let settings = GatewaySettings {
        upload_dir: config.upload_dir,
        submit_retries: config.submit_retries,
        submit_backoff: FixedBackoff::new(Duration::from_secs(1)),
    };

    run_server(config.addr, broker, settings).await?;
    Ok(())
}
