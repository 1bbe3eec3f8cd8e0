// net/tcp.rs — relay connection
use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::info;

use crate::config::Config;

pub async fn connect(cfg: &Config) -> Result<TcpStream> {
    let stream = TcpStream::connect(&cfg.relay_addr)
        .await
        .with_context(|| format!("connecting to relay {}", cfg.relay_addr))?;
    // commands are tiny; don't let Nagle hold them back
    stream.set_nodelay(true)?;
    info!(relay = %cfg.relay_addr, "relay connection established");
    Ok(stream)
}
