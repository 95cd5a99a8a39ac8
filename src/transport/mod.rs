//! Transport layer for MCP communication.
//!
//! A transport frames whole JSON messages in both directions. The server is
//! generic over this trait so tests can drive it with an in-memory
//! implementation instead of real standard streams.

pub mod stdio;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ServerError;

/// Message-framing boundary between the server and its host process.
#[async_trait]
pub trait Transport {
    /// Start the transport.
    async fn start(&mut self) -> Result<(), ServerError>;

    /// Send a message.
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), ServerError>;

    /// Receive a message. Returns [`ServerError::Closed`] once the peer has
    /// hung up and no further messages will arrive.
    async fn receive<T: DeserializeOwned + Send + Sync>(&mut self) -> Result<T, ServerError>;

    /// Close the transport.
    async fn close(&mut self) -> Result<(), ServerError>;
}
