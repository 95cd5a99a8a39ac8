//! Line-delimited JSON transport over stdin/stdout.
//!
//! Writes are funneled through a dedicated task fed by a channel, so clones
//! of the transport (used by concurrently handled calls) can all respond
//! without interleaving partial lines on stdout.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::error::ServerError;
use crate::transport::Transport;

enum WriterCommand {
    Line(String),
    /// Barrier: acknowledged once every line queued before it has been
    /// written and flushed.
    Flush(oneshot::Sender<()>),
}

/// Standard IO transport.
pub struct StdioTransport {
    reader: BufReader<Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    is_connected: bool,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    /// Create a new stdio transport using stdin and stdout.
    pub fn new() -> Self {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(32);

        // One writer task serializes all outgoing lines.
        tokio::spawn(async move {
            let mut writer = tokio::io::BufWriter::new(tokio::io::stdout());
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Line(message) => {
                        if let Err(e) = writer.write_all(message.as_bytes()).await {
                            eprintln!("Error writing to stdout: {}", e);
                        }
                        if let Err(e) = writer.write_all(b"\n").await {
                            eprintln!("Error writing newline to stdout: {}", e);
                        }
                        if let Err(e) = writer.flush().await {
                            eprintln!("Error flushing stdout: {}", e);
                        }
                    }
                    WriterCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            reader: BufReader::new(Box::new(tokio::io::stdin())),
            writer_tx,
            is_connected: false,
        }
    }

    /// Create a stdio transport reading from a custom source instead of
    /// stdin. Output still goes to stdout.
    pub fn with_reader(reader: Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>) -> Self {
        let mut transport = Self::new();
        transport.reader = BufReader::new(reader);
        transport
    }
}

impl Clone for StdioTransport {
    fn clone(&self) -> Self {
        // Clones share the writer channel but never read: they exist so
        // spawned call handlers can send their responses.
        Self {
            reader: BufReader::new(Box::new(tokio::io::stdin())),
            writer_tx: self.writer_tx.clone(),
            is_connected: self.is_connected,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&mut self) -> Result<(), ServerError> {
        self.is_connected = true;
        Ok(())
    }

    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), ServerError> {
        if !self.is_connected {
            return Err(ServerError::Transport(
                "Transport not connected".to_string(),
            ));
        }

        let json = serde_json::to_string(message)?;

        self.writer_tx
            .send(WriterCommand::Line(json))
            .await
            .map_err(|e| {
                ServerError::Transport(format!("Failed to send message to writer: {}", e))
            })
    }

    async fn receive<T: DeserializeOwned + Send + Sync>(&mut self) -> Result<T, ServerError> {
        if !self.is_connected {
            return Err(ServerError::Transport(
                "Transport not connected".to_string(),
            ));
        }

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ServerError::Transport(format!("Failed to read: {}", e)))?;

        // read_line returns 0 only at EOF: the host has hung up.
        if read == 0 {
            return Err(ServerError::Closed);
        }

        serde_json::from_str(&line).map_err(ServerError::from)
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        // Wait for queued replies to reach stdout before reporting closed,
        // otherwise the final reply can be lost when the process exits.
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .writer_tx
            .send(WriterCommand::Flush(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        self.is_connected = false;
        Ok(())
    }
}
