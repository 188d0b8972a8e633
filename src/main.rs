// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Central MCP Server Binary
//!
//! Starts the control plane: loads configuration (file + environment),
//! initializes logging, and serves the registry, load-balancing and
//! discovery API until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use central_mcp_server::config::ServerConfig;
use central_mcp_server::logging;
use central_mcp_server::server::CentralMcpServer;

#[derive(Parser)]
#[command(name = "central-mcp-server")]
#[command(about = "Central MCP server for worker registration, health monitoring and load balancing")]
pub struct Args {
    /// Configuration file path (TOML); environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_from_env()?;

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }

    info!("starting central MCP server");
    info!("{}", config.summary());

    let server = CentralMcpServer::new(config)?;
    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        return Err(e);
    }

    Ok(())
}
