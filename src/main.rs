//! Smart Search MCP server binary.
//!
//! Reads the composite credential from the environment, then serves the
//! `smartsearch` tool over stdio until the host disconnects.

use anyhow::Context;
use clap::Parser;
use log::info;
use smartsearch_mcp::{
    error::ServerError,
    search::{SearchConfig, SmartSearch, TOOL_NAME},
    server::{Server, ServerConfig},
    transport::stdio::StdioTransport,
};

/// MCP server exposing a remote smart-search web API as a single tool
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Composite credential of the form '<endpointId>-<apiKey>'
    #[arg(long, env = "SERVER_KEY", hide_env_values = true)]
    server_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_key = args
        .server_key
        .filter(|key| !key.is_empty())
        .context("SERVER_KEY environment variable is required.")?;

    let search = SmartSearch::new(SearchConfig::new(server_key));

    let config = ServerConfig::new()
        .with_name("smartsearch")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_tool(search.definition());

    let mut server = Server::new(config);
    server.register_tool_handler(TOOL_NAME, move |params| {
        let search = search.clone();
        async move { search.call(params).await.map_err(ServerError::from) }
    })?;

    info!("Smart Search MCP Server running on stdio");

    server.serve(StdioTransport::new()).await?;
    Ok(())
}
