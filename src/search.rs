//! The smartsearch tool: forwards a search request to the remote smart
//! search API and returns the upstream JSON verbatim.

use std::collections::HashMap;

use log::debug;
use serde_json::{json, Value};
use thiserror::Error;

use crate::schema::common::{Tool, ToolInputSchema};

/// Name under which the tool is listed and called.
pub const TOOL_NAME: &str = "smartsearch";

/// Base URL of the upstream search API.
pub const SEARCH_API_ENDPOINT: &str = "https://searchapi.xiaosuai.com";

/// Failures that can occur while performing a search. All of these are
/// recovered by the server into an error-flagged tool reply; none of them
/// terminate the process.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid arguments for smartsearch. 'query' is required.")]
    InvalidArguments,

    #[error("Invalid SERVER_KEY format. Expected 'endpoint-apikey'.")]
    InvalidCredentialFormat,

    #[error("API Error: {status} {status_text}")]
    Upstream { status: u16, status_text: String },

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// Configuration for the search tool.
///
/// The server key is the composite credential `<endpointId>-<apiKey>`:
/// the part before the first hyphen routes the request, the rest
/// authenticates it. It is split per call, so a malformed key surfaces
/// as a per-call error rather than at startup.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    server_key: String,
    endpoint: String,
}

impl SearchConfig {
    pub fn new(server_key: impl Into<String>) -> Self {
        Self {
            server_key: server_key.into(),
            endpoint: SEARCH_API_ENDPOINT.to_string(),
        }
    }

    /// Override the upstream base URL. Tests point this at a local mock.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Split the server key on the first hyphen into (endpoint id, API key).
    ///
    /// Only the first hyphen separates: an API key may itself contain
    /// hyphens. Either half being empty is a format error.
    fn credentials(&self) -> Result<(&str, &str), SearchError> {
        match self.server_key.split_once('-') {
            Some((endpoint_id, api_key)) if !endpoint_id.is_empty() && !api_key.is_empty() => {
                Ok((endpoint_id, api_key))
            }
            _ => Err(SearchError::InvalidCredentialFormat),
        }
    }
}

/// The smartsearch tool itself. Cheap to clone; clones share the
/// underlying HTTP connection pool.
#[derive(Clone)]
pub struct SmartSearch {
    config: SearchConfig,
    client: reqwest::Client,
}

impl SmartSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// The tool descriptor advertised by `tools/list`.
    pub fn definition(&self) -> Tool {
        let mut properties = HashMap::new();
        properties.insert(
            "query".to_string(),
            json!({ "type": "string", "description": "The search query." }),
        );
        properties.insert(
            "count".to_string(),
            json!({ "type": "number", "description": "Number of results to return.", "default": 10 }),
        );
        properties.insert(
            "offset".to_string(),
            json!({ "type": "number", "description": "Offset for pagination.", "default": 0 }),
        );
        properties.insert(
            "setLang".to_string(),
            json!({ "type": "string", "description": "Language for the search.", "default": "en" }),
        );
        properties.insert(
            "safeSearch".to_string(),
            json!({ "type": "string", "description": "Safe search level ('Strict', 'Moderate', 'Off').", "default": "Strict" }),
        );

        Tool {
            name: TOOL_NAME.to_string(),
            description: Some("Performs a web search using a remote smart search API.".to_string()),
            input_schema: ToolInputSchema {
                r#type: "object".to_string(),
                properties: Some(properties),
                required: Some(vec!["query".to_string()]),
            },
        }
    }

    /// Perform one search call.
    ///
    /// Validates the arguments, then issues a single GET to the upstream
    /// API and returns its JSON body untouched. Absent optional arguments
    /// take the defaults advertised in the descriptor. No request is sent
    /// when validation or credential parsing fails.
    pub async fn call(&self, args: Value) -> Result<Value, SearchError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or(SearchError::InvalidArguments)?;

        let count = match args.get("count") {
            Some(Value::Number(n)) => n.to_string(),
            _ => "10".to_string(),
        };
        let offset = match args.get("offset") {
            Some(Value::Number(n)) => n.to_string(),
            _ => "0".to_string(),
        };
        let mkt = args.get("setLang").and_then(Value::as_str).unwrap_or("en");
        let safe_search = args
            .get("safeSearch")
            .and_then(Value::as_str)
            .unwrap_or("Strict");

        let (endpoint_id, api_key) = self.config.credentials()?;
        let url = format!("{}/search/{}/smart", self.config.endpoint, endpoint_id);

        debug!(
            "smartsearch: GET {} q={:?} count={} offset={} mkt={} safeSearch={}",
            url, query, count, offset, mkt, safe_search
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", query),
                ("count", count.as_str()),
                ("offset", offset.as_str()),
                ("mkt", mkt),
                ("safeSearch", safe_search),
            ])
            .header("Authorization", format!("Bearer {}", api_key))
            .header("pragma", "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Upstream {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let body = response.text().await?;
        let result = serde_json::from_str(&body)?;
        Ok(result)
    }
}
