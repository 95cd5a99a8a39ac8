//! # Smart Search MCP Server
//!
//! A Model Context Protocol (MCP) server that exposes a single tool,
//! `smartsearch`, which forwards web search requests to a remote smart
//! search API and returns the upstream JSON unchanged.
//!
//! The crate is split into:
//! - Schema definitions for the MCP messages it speaks
//! - A stdio transport carrying line-delimited JSON-RPC
//! - The server loop dispatching protocol requests and tool calls
//! - The smartsearch tool itself

pub mod error;
pub mod schema;
pub mod search;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use error::ServerError;
pub use schema::common::Tool;
pub use schema::json_rpc::{JSONRPCMessage, RequestId};

/// Protocol version constants
pub mod constants {
    /// The MCP protocol version this server speaks
    pub const LATEST_PROTOCOL_VERSION: &str = "2024-11-05";
    /// The JSON-RPC version used by MCP
    pub const JSONRPC_VERSION: &str = "2.0";
}
