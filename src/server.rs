//! Asynchronous MCP server loop.
//!
//! The server reads JSON-RPC messages from a transport, answers the protocol
//! requests it knows (initialize, tools/list, tools/call, ping, shutdown) and
//! dispatches tool calls to registered handlers. Each tools/call runs in its
//! own task so a slow upstream request never blocks the read loop.
//!
//! Tool failures are deliberately not JSON-RPC errors: every failure on the
//! call path is folded into a normal reply carrying an error-flagged text
//! block, so the host always gets a well-formed tool result back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::{json, Value};
//! use smartsearch_mcp::{
//!     error::ServerError,
//!     server::{Server, ServerConfig},
//!     transport::stdio::StdioTransport,
//!     Tool,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     let config = ServerConfig::new()
//!         .with_name("my-server")
//!         .with_version("1.0.0")
//!         .with_tool(Tool {
//!             name: "greet".to_string(),
//!             description: Some("Say hello".to_string()),
//!             input_schema: smartsearch_mcp::schema::common::ToolInputSchema {
//!                 r#type: "object".to_string(),
//!                 properties: None,
//!                 required: None,
//!             },
//!         });
//!
//!     let mut server = Server::new(config);
//!     server.register_tool_handler("greet", |_params: Value| async move {
//!         Ok(json!({ "greeting": "hello" }))
//!     })?;
//!
//!     server.serve(StdioTransport::new()).await
//! }
//! ```

use crate::{
    constants::LATEST_PROTOCOL_VERSION,
    error::ServerError,
    schema::{
        client::{CallToolParams, ListToolsResult},
        common::{Implementation, TextContent, Tool},
        json_rpc::{JSONRPCError, JSONRPCMessage, JSONRPCResponse, RequestId},
        server::{
            CallToolResult, InitializeResult, ServerCapabilities, ToolResultContent,
            ToolsCapability,
        },
    },
    transport::Transport,
};
use log::{debug, error, info};
use serde_json::{json, Value};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};
use tokio::sync::Mutex;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Server name, reported to the client during initialization
    pub name: String,
    /// Server version
    pub version: String,
    /// Tools advertised by tools/list
    pub tools: Vec<Tool>,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new() -> Self {
        Self {
            name: "MCP Server".to_string(),
            version: "1.0.0".to_string(),
            tools: Vec::new(),
        }
    }

    /// Set the server name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the server version
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Add a tool to the server
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Tool handler function type for async tool execution
pub type AsyncToolHandler = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, ServerError>> + Send>>
        + Send
        + Sync,
>;

/// High-level MCP server
pub struct Server<T: Transport + Send + Sync> {
    config: ServerConfig,
    tool_handlers: Arc<Mutex<HashMap<String, AsyncToolHandler>>>,
    transport: Option<T>,
}

impl<T: Transport + Send + Sync + Clone + 'static> Server<T> {
    /// Create a new MCP server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            tool_handlers: Arc::new(Mutex::new(HashMap::new())),
            transport: None,
        }
    }

    /// Register a tool handler
    ///
    /// The tool must already be declared in the server configuration.
    pub fn register_tool_handler<F, Fut>(
        &mut self,
        tool_name: &str,
        handler: F,
    ) -> Result<(), ServerError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ServerError>> + Send + 'static,
    {
        if !self.config.tools.iter().any(|t| t.name == tool_name) {
            return Err(ServerError::Protocol(format!(
                "Tool '{}' not found in server configuration",
                tool_name
            )));
        }

        let async_handler: AsyncToolHandler = Box::new(move |params| {
            let fut = handler(params);
            Box::pin(fut) as Pin<Box<dyn Future<Output = Result<Value, ServerError>> + Send>>
        });

        let mut handlers = self.tool_handlers.try_lock().map_err(|_| {
            ServerError::Protocol("Failed to acquire lock on tool handlers".to_string())
        })?;
        handlers.insert(tool_name.to_string(), async_handler);

        Ok(())
    }

    /// Start the server with the given transport and process messages until
    /// the client asks for shutdown or the input stream closes.
    pub async fn serve(&mut self, mut transport: T) -> Result<(), ServerError> {
        transport.start().await?;
        self.transport = Some(transport);
        self.process_messages().await
    }

    /// Process incoming messages
    async fn process_messages(&mut self) -> Result<(), ServerError> {
        loop {
            let message = {
                let transport = self
                    .transport
                    .as_mut()
                    .ok_or_else(|| ServerError::Protocol("Transport not initialized".to_string()))?;

                match transport.receive::<JSONRPCMessage>().await {
                    Ok(msg) => msg,
                    Err(ServerError::Closed) => {
                        info!("Input stream closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        continue;
                    }
                }
            };

            match message {
                JSONRPCMessage::Request(request) => {
                    let id = request.id.clone();
                    let method = request.method.clone();
                    let params = request.params.clone();

                    match method.as_str() {
                        "initialize" => {
                            info!("Received initialization request");
                            if let Err(e) = self.handle_initialize(id).await {
                                error!("Error handling initialize request: {}", e);
                            }
                        }
                        "tools/list" => {
                            debug!("Received tools list request");
                            if let Err(e) = self.handle_tools_list(id).await {
                                error!("Error handling tools/list request: {}", e);
                            }
                        }
                        "tools/call" => {
                            debug!("Received tools/call request");
                            // Handle the call in its own task so the read
                            // loop stays responsive during the upstream request.
                            let handler = self.clone_for_tools_call();
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle_tools_call(id, params).await {
                                    error!("Error handling tools/call request: {}", e);
                                }
                            });
                        }
                        "ping" => {
                            debug!("Received ping request");
                            if let Err(e) = self.handle_ping(id).await {
                                error!("Error handling ping request: {}", e);
                            }
                        }
                        "shutdown" => {
                            info!("Received shutdown request");
                            if let Err(e) = self.handle_shutdown(id).await {
                                error!("Error handling shutdown request: {}", e);
                            }
                            break;
                        }
                        _ => {
                            error!("Unknown method: {}", method);
                            if let Err(e) = self
                                .send_error(id, -32601, format!("Method not found: {}", method))
                                .await
                            {
                                error!("Error sending error response: {}", e);
                            }
                        }
                    }
                }
                JSONRPCMessage::Notification(notification) => {
                    match notification.method.as_str() {
                        "notifications/initialized" => {
                            info!("Client initialized");
                        }
                        other => {
                            debug!("Received unknown notification: {}", other);
                        }
                    }
                }
                _ => {
                    error!("Unexpected message type");
                    continue;
                }
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.close().await?;
        }

        Ok(())
    }

    /// Create a handle for processing a tool call concurrently
    fn clone_for_tools_call(&self) -> ToolCallHandler<T> {
        ToolCallHandler {
            tool_handlers: self.tool_handlers.clone(),
            transport: self.transport.as_ref().cloned(),
        }
    }

    /// Handle initialization request
    async fn handle_initialize(&mut self, id: RequestId) -> Result<(), ServerError> {
        let capabilities = ServerCapabilities {
            tools: if !self.config.tools.is_empty() {
                Some(ToolsCapability {
                    list_changed: Some(false),
                })
            } else {
                None
            },
        };

        let server_info = Implementation {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        };

        let init_result = InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            server_info,
            instructions: None,
        };

        let response = JSONRPCResponse::new(id, serde_json::to_value(init_result)?);
        self.send_message(&JSONRPCMessage::Response(response)).await
    }

    /// Handle tools list request
    async fn handle_tools_list(&mut self, id: RequestId) -> Result<(), ServerError> {
        let tools_list = ListToolsResult {
            next_cursor: None,
            tools: self.config.tools.clone(),
        };

        let response = JSONRPCResponse::new(id, serde_json::to_value(tools_list)?);
        self.send_message(&JSONRPCMessage::Response(response)).await
    }

    /// Handle ping request
    async fn handle_ping(&mut self, id: RequestId) -> Result<(), ServerError> {
        let response = JSONRPCResponse::new(id, json!({}));
        self.send_message(&JSONRPCMessage::Response(response)).await
    }

    /// Handle shutdown request
    async fn handle_shutdown(&mut self, id: RequestId) -> Result<(), ServerError> {
        let response = JSONRPCResponse::new(id, json!({}));
        self.send_message(&JSONRPCMessage::Response(response)).await
    }

    /// Send an error response
    async fn send_error(
        &mut self,
        id: RequestId,
        code: i32,
        message: String,
    ) -> Result<(), ServerError> {
        let error = JSONRPCMessage::Error(JSONRPCError::new(id, code, message, None));
        self.send_message(&error).await
    }

    async fn send_message(&mut self, message: &JSONRPCMessage) -> Result<(), ServerError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ServerError::Protocol("Transport not initialized".to_string()))?;
        transport.send(message).await
    }
}

/// Handle for processing one tools/call request in a spawned task
struct ToolCallHandler<T: Transport + Send + Sync> {
    tool_handlers: Arc<Mutex<HashMap<String, AsyncToolHandler>>>,
    transport: Option<T>,
}

impl<T: Transport + Send + Sync + Clone> ToolCallHandler<T> {
    /// Run the requested tool and reply.
    ///
    /// Whatever goes wrong here (bad parameters, unknown tool, handler
    /// failure) the client gets a normal reply whose text block carries
    /// `Error: <message>` and whose error flag is set. Only the transport
    /// write itself can fail out of this function.
    async fn handle_tools_call(
        &self,
        id: RequestId,
        params: Option<Value>,
    ) -> Result<(), ServerError> {
        let tool_result = match self.execute_tool_call(params).await {
            Ok(value) => CallToolResult {
                content: vec![ToolResultContent::Text(TextContent::new(
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                ))],
                is_error: Some(false),
            },
            Err(e) => CallToolResult {
                content: vec![ToolResultContent::Text(TextContent::new(format!(
                    "Error: {}",
                    e
                )))],
                is_error: Some(true),
            },
        };

        let response = JSONRPCResponse::new(id, serde_json::to_value(tool_result)?);

        let mut transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ServerError::Protocol("Transport not initialized".to_string()))?
            .clone();
        transport.send(&JSONRPCMessage::Response(response)).await
    }

    /// Parse the call parameters and run the matching handler
    async fn execute_tool_call(&self, params: Option<Value>) -> Result<Value, ServerError> {
        let params = params.ok_or_else(|| {
            ServerError::Protocol("Missing parameters in tools/call request".to_string())
        })?;

        let call_params: CallToolParams = serde_json::from_value(params)
            .map_err(|e| ServerError::Protocol(format!("Invalid tools/call parameters: {}", e)))?;

        let arguments = call_params.arguments.unwrap_or(Value::Null);

        let handlers = self.tool_handlers.lock().await;
        let handler = handlers
            .get(&call_params.name)
            .ok_or_else(|| ServerError::UnknownTool(call_params.name.clone()))?;

        let future = handler(arguments);
        drop(handlers); // Release the lock before awaiting
        future.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        common::ToolInputSchema,
        json_rpc::{JSONRPCNotification, JSONRPCRequest},
    };
    use async_trait::async_trait;
    use serde::{de::DeserializeOwned, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    // Mock transport backed by channels: receive blocks until a message is
    // queued, and closing the input side behaves like stdin reaching EOF.
    #[derive(Clone)]
    struct MockTransport {
        input_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        input_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        sent_tx: mpsc::UnboundedSender<String>,
        sent_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    }

    impl MockTransport {
        fn new() -> Self {
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            Self {
                input_tx: Arc::new(Mutex::new(Some(input_tx))),
                input_rx: Arc::new(Mutex::new(input_rx)),
                sent_tx,
                sent_rx: Arc::new(Mutex::new(sent_rx)),
            }
        }

        async fn queue_message(&self, message: JSONRPCMessage) {
            let serialized = serde_json::to_string(&message).unwrap();
            let tx = self.input_tx.lock().await;
            tx.as_ref().unwrap().send(serialized).unwrap();
        }

        /// Simulate the host closing our stdin.
        async fn close_input(&self) {
            self.input_tx.lock().await.take();
        }

        async fn next_sent(&self) -> JSONRPCMessage {
            let mut rx = self.sent_rx.lock().await;
            let raw = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("server dropped its transport without replying");
            serde_json::from_str(&raw).unwrap()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn start(&mut self) -> Result<(), ServerError> {
            Ok(())
        }

        async fn send<T: Serialize + Send + Sync>(
            &mut self,
            message: &T,
        ) -> Result<(), ServerError> {
            let serialized = serde_json::to_string(message)?;
            self.sent_tx
                .send(serialized)
                .map_err(|e| ServerError::Transport(e.to_string()))
        }

        async fn receive<T: DeserializeOwned + Send + Sync>(&mut self) -> Result<T, ServerError> {
            let mut rx = self.input_rx.lock().await;
            match rx.recv().await {
                Some(message) => serde_json::from_str(&message).map_err(ServerError::from),
                None => Err(ServerError::Closed),
            }
        }

        async fn close(&mut self) -> Result<(), ServerError> {
            Ok(())
        }
    }

    fn search_tool() -> Tool {
        Tool {
            name: "smartsearch".to_string(),
            description: Some("Performs a web search using a remote smart search API.".to_string()),
            input_schema: ToolInputSchema {
                r#type: "object".to_string(),
                properties: Some(
                    [(
                        "query".to_string(),
                        json!({ "type": "string", "description": "The search query." }),
                    )]
                    .into_iter()
                    .collect(),
                ),
                required: Some(vec!["query".to_string()]),
            },
        }
    }

    fn spawn_server<F, Fut>(handler: F) -> (MockTransport, JoinHandle<Result<(), ServerError>>)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ServerError>> + Send + 'static,
    {
        let config = ServerConfig::new()
            .with_name("smartsearch")
            .with_version("0.1.1")
            .with_tool(search_tool());

        let mut server = Server::new(config);
        server.register_tool_handler("smartsearch", handler).unwrap();

        let transport = MockTransport::new();
        let server_transport = transport.clone();
        let handle = tokio::spawn(async move { server.serve(server_transport).await });

        (transport, handle)
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> JSONRPCMessage {
        JSONRPCMessage::Request(JSONRPCRequest::new(
            RequestId::Number(id),
            method.to_string(),
            params,
        ))
    }

    fn expect_response(message: JSONRPCMessage) -> JSONRPCResponse {
        match message {
            JSONRPCMessage::Response(resp) => resp,
            other => panic!("expected response, got {:?}", other),
        }
    }

    async fn shut_down(
        transport: &MockTransport,
        handle: JoinHandle<Result<(), ServerError>>,
    ) {
        transport.queue_message(request(999, "shutdown", None)).await;
        let _ = transport.next_sent().await;
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server returned an error");
    }

    #[tokio::test]
    async fn initialize_reports_server_info_and_tools_capability() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport
            .queue_message(request(
                1,
                "initialize",
                Some(json!({ "protocolVersion": LATEST_PROTOCOL_VERSION })),
            ))
            .await;

        let resp = expect_response(transport.next_sent().await);
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(
            resp.result.get("protocolVersion").and_then(Value::as_str),
            Some(LATEST_PROTOCOL_VERSION)
        );
        assert_eq!(
            resp.result
                .get("serverInfo")
                .and_then(|i| i.get("name"))
                .and_then(Value::as_str),
            Some("smartsearch")
        );
        assert!(
            resp.result
                .get("capabilities")
                .and_then(|c| c.get("tools"))
                .is_some(),
            "tools capability missing"
        );

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn tools_list_always_returns_the_single_descriptor() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        for id in [1, 2] {
            transport.queue_message(request(id, "tools/list", None)).await;
            let resp = expect_response(transport.next_sent().await);
            assert_eq!(resp.id, RequestId::Number(id));

            let tools = resp.result.get("tools").and_then(Value::as_array).unwrap();
            assert_eq!(tools.len(), 1);
            assert_eq!(
                tools[0].get("name").and_then(Value::as_str),
                Some("smartsearch")
            );
            assert_eq!(
                tools[0]
                    .get("inputSchema")
                    .and_then(|s| s.get("required"))
                    .unwrap(),
                &json!(["query"])
            );
        }

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn tools_call_success_is_pretty_printed_and_unflagged() {
        let upstream = json!({ "items": [{ "title": "a" }], "total": 1 });
        let expected = upstream.clone();
        let (transport, handle) =
            spawn_server(move |_| { let value = upstream.clone(); async move { Ok(value) } });

        transport
            .queue_message(request(
                1,
                "tools/call",
                Some(json!({ "name": "smartsearch", "arguments": { "query": "rust" } })),
            ))
            .await;

        let resp = expect_response(transport.next_sent().await);
        let result: CallToolResult = serde_json::from_value(resp.result).unwrap();
        assert_eq!(result.is_error, Some(false));

        let ToolResultContent::Text(content) = &result.content[0];
        assert_eq!(content.r#type, "text");
        // The text is the upstream payload, pretty printed.
        assert!(content.text.contains('\n'));
        let reparsed: Value = serde_json::from_str(&content.text).unwrap();
        assert_eq!(reparsed, expected);

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn tool_failure_is_a_flagged_reply_not_an_rpc_error() {
        let (transport, handle) = spawn_server(|_| async {
            Err(ServerError::Protocol("upstream exploded".to_string()))
        });

        transport
            .queue_message(request(
                7,
                "tools/call",
                Some(json!({ "name": "smartsearch", "arguments": { "query": "q" } })),
            ))
            .await;

        let resp = expect_response(transport.next_sent().await);
        assert_eq!(resp.id, RequestId::Number(7));
        let result: CallToolResult = serde_json::from_value(resp.result).unwrap();
        assert_eq!(result.is_error, Some(true));

        let ToolResultContent::Text(content) = &result.content[0];
        assert!(content.text.starts_with("Error: "));
        assert!(content.text.contains("upstream exploded"));

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn unknown_tool_is_a_flagged_reply() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport
            .queue_message(request(
                3,
                "tools/call",
                Some(json!({ "name": "websearch", "arguments": { "query": "q" } })),
            ))
            .await;

        let resp = expect_response(transport.next_sent().await);
        let result: CallToolResult = serde_json::from_value(resp.result).unwrap();
        assert_eq!(result.is_error, Some(true));

        let ToolResultContent::Text(content) = &result.content[0];
        assert_eq!(content.text, "Error: Unknown tool: websearch");

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn missing_call_params_are_a_flagged_reply() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport.queue_message(request(4, "tools/call", None)).await;

        let resp = expect_response(transport.next_sent().await);
        let result: CallToolResult = serde_json::from_value(resp.result).unwrap();
        assert_eq!(result.is_error, Some(true));

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn ping_gets_an_empty_result() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport.queue_message(request(5, "ping", None)).await;

        let resp = expect_response(transport.next_sent().await);
        assert_eq!(resp.id, RequestId::Number(5));
        assert_eq!(resp.result, json!({}));

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport
            .queue_message(request(6, "resources/list", None))
            .await;

        match transport.next_sent().await {
            JSONRPCMessage::Error(err) => {
                assert_eq!(err.id, RequestId::Number(6));
                assert_eq!(err.error.code, -32601);
                assert!(err.error.message.contains("resources/list"));
            }
            other => panic!("expected error message, got {:?}", other),
        }

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn initialized_notification_needs_no_reply() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport
            .queue_message(JSONRPCMessage::Notification(JSONRPCNotification::new(
                "notifications/initialized".to_string(),
                None,
            )))
            .await;

        // The next reply must belong to the ping, not the notification.
        transport.queue_message(request(8, "ping", None)).await;
        let resp = expect_response(transport.next_sent().await);
        assert_eq!(resp.id, RequestId::Number(8));

        shut_down(&transport, handle).await;
    }

    #[tokio::test]
    async fn server_stops_when_input_closes() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport.close_input().await;

        let result = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop on EOF")
            .expect("server task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_replies_then_stops() {
        let (transport, handle) = spawn_server(|_| async { Ok(json!({})) });

        transport.queue_message(request(9, "shutdown", None)).await;

        let resp = expect_response(transport.next_sent().await);
        assert_eq!(resp.id, RequestId::Number(9));

        let result = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop after shutdown")
            .expect("server task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn registering_a_handler_for_an_undeclared_tool_fails() {
        let mut server: Server<MockTransport> = Server::new(ServerConfig::new());
        let result = server.register_tool_handler("smartsearch", |_| async { Ok(json!({})) });
        assert!(matches!(result, Err(ServerError::Protocol(_))));
    }
}
