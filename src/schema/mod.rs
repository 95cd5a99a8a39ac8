//! Schema definitions for the MCP messages this server exchanges.
//!
//! The wire format is JSON-RPC 2.0 with MCP's camelCase payload conventions
//! (`protocolVersion`, `inputSchema`, `isError`, ...). Only the tool-facing
//! subset of the protocol is modeled here: this server advertises no prompt
//! or resource capabilities.

pub mod client;
pub mod common;
pub mod json_rpc;
pub mod server;

pub use client::{CallToolParams, ListToolsResult};
pub use common::{Implementation, TextContent, Tool, ToolInputSchema};
pub use json_rpc::{
    JSONRPCError, JSONRPCMessage, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, RequestId,
};
pub use server::{
    CallToolResult, InitializeResult, ServerCapabilities, ToolResultContent, ToolsCapability,
};
