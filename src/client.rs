//! Notebook management HTTP API client.
//!
//! Handles notebook lifecycle (`create`, `get`, `fork`, `delete`) against
//! the management endpoints and constructs [`Session`]s for the returned
//! notebooks. All requests carry `Authorization: Bearer <token>`; the base
//! URL defaults to the canonical service and can be overridden per client
//! or via the `NOTEBOOK_API_URL` environment variable.

use serde::{Deserialize, Serialize};

use crate::constants::{user_agent, DEFAULT_API_URL, HTTP_REQUEST_TIMEOUT};
use crate::error::SdkError;
use crate::session::{Session, SessionOptions};
use crate::transport::TransportOptions;

/// A notebook record returned by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookData {
    /// Notebook id.
    pub id: String,
    /// Duplex channel URL for this notebook.
    #[serde(rename = "okraUrl")]
    pub okra_url: String,
    /// Notebook type (template).
    #[serde(rename = "type")]
    pub kind: String,
}

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Management API base URL; `None` uses the canonical default.
    pub api_url: Option<String>,
    /// Log every outbound request and inbound frame on session
    /// transports at debug level.
    pub debug: bool,
    /// Report the SDK version in a `User-Agent` header on management
    /// API requests so the service can track client versions. Disable
    /// to send no identifying header.
    pub telemetry: bool,
    /// Construct sessions with lazily-connecting transports.
    pub start_closed: bool,
    /// Injectable HTTP client (testing, custom proxies).
    pub http: Option<reqwest::Client>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_url: None,
            debug: false,
            telemetry: true,
            start_closed: true,
            http: None,
        }
    }
}

impl ClientOptions {
    /// Apply environment overrides (`NOTEBOOK_API_URL`).
    #[must_use]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(api_url) = std::env::var("NOTEBOOK_API_URL") {
            if !api_url.is_empty() {
                self.api_url = Some(api_url);
            }
        }
        self
    }
}

/// Client for the notebook management API.
#[derive(Debug, Clone)]
pub struct NotebookClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    options: ClientOptions,
}

impl NotebookClient {
    /// Create a client with the given API token.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidConfig`] for an empty token or when the
    /// HTTP client cannot be built.
    pub fn new(token: &str, options: ClientOptions) -> Result<Self, SdkError> {
        if token.is_empty() {
            return Err(SdkError::InvalidConfig("API token must not be empty".into()));
        }
        let http = match &options.http {
            Some(client) => client.clone(),
            None => reqwest::Client::builder()
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .map_err(|e| SdkError::InvalidConfig(format!("HTTP client: {e}")))?,
        };
        let base_url = options
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self { http, base_url, token: token.to_string(), options })
    }

    /// Create a client from `NOTEBOOK_API_TOKEN` / `NOTEBOOK_API_URL`.
    ///
    /// # Errors
    ///
    /// [`SdkError::InvalidConfig`] when the token variable is unset.
    pub fn from_env() -> Result<Self, SdkError> {
        let token = std::env::var("NOTEBOOK_API_TOKEN")
            .map_err(|_| SdkError::InvalidConfig("NOTEBOOK_API_TOKEN is not set".into()))?;
        Self::new(&token, ClientOptions::default().apply_env_overrides())
    }

    /// Management API base URL in use.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a notebook of the given type.
    ///
    /// # Errors
    ///
    /// [`SdkError::Api`] for non-success statuses, `ConnectionLost` for
    /// network failures.
    pub async fn create(&self, kind: &str) -> Result<NotebookData, SdkError> {
        let url = format!("{}/notebook", self.base_url);
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "type": kind }))
            .send()
            .await
            .map_err(request_error)?;
        parse_notebook(response).await
    }

    /// Fetch a notebook by id.
    ///
    /// # Errors
    ///
    /// See [`NotebookClient::create`].
    pub async fn get(&self, id: &str) -> Result<NotebookData, SdkError> {
        let url = format!("{}/notebook/{id}", self.base_url);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(request_error)?;
        parse_notebook(response).await
    }

    /// Fork a notebook.
    ///
    /// # Errors
    ///
    /// See [`NotebookClient::create`].
    pub async fn fork(&self, id: &str) -> Result<NotebookData, SdkError> {
        let url = format!("{}/notebook/{id}/fork", self.base_url);
        let response = self
            .request(reqwest::Method::POST, &url)
            .send()
            .await
            .map_err(request_error)?;
        parse_notebook(response).await
    }

    /// Delete a notebook.
    ///
    /// # Errors
    ///
    /// See [`NotebookClient::create`].
    pub async fn delete(&self, id: &str) -> Result<(), SdkError> {
        let url = format!("{}/notebook/{id}", self.base_url);
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(request_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    /// Base request with auth and the telemetry-gated identity header.
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url).bearer_auth(&self.token);
        if self.options.telemetry {
            builder = builder.header(reqwest::header::USER_AGENT, user_agent());
        }
        builder
    }

    /// Open a session on a notebook.
    ///
    /// # Errors
    ///
    /// [`SdkError::InvalidConfig`] when transport validation fails.
    pub fn connect(&self, notebook: NotebookData) -> Result<Session, SdkError> {
        log::info!("opening session for notebook {}", notebook.id);
        let transport = TransportOptions {
            start_closed: self.options.start_closed,
            debug: self.options.debug,
            ..TransportOptions::default()
        };
        Session::new(notebook, SessionOptions { transport })
    }
}

fn request_error(e: reqwest::Error) -> SdkError {
    if e.is_timeout() {
        SdkError::ConnectionTimeout
    } else {
        SdkError::ConnectionLost(e.to_string())
    }
}

async fn parse_notebook(response: reqwest::Response) -> Result<NotebookData, SdkError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response
        .json::<NotebookData>()
        .await
        .map_err(|e| SdkError::InvalidMessage(format!("notebook payload: {e}")))
}

async fn status_error(response: reqwest::Response) -> SdkError {
    let code = i64::from(response.status().as_u16());
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "request failed".to_string());
    SdkError::Api { code, message, raw: crate::codec::Value::Null }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            NotebookClient::new("", ClientOptions::default()),
            Err(SdkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_base_url_default_and_trim() {
        let client = NotebookClient::new("tok", ClientOptions::default()).expect("client");
        assert_eq!(client.base_url(), DEFAULT_API_URL);

        let client = NotebookClient::new(
            "tok",
            ClientOptions { api_url: Some("https://api.example.test/".into()), ..ClientOptions::default() },
        )
        .expect("client");
        assert_eq!(client.base_url(), "https://api.example.test");
    }

    #[test]
    fn test_notebook_data_wire_names() {
        let notebook: NotebookData = serde_json::from_str(
            r#"{"id":"nb-1","okraUrl":"wss://nb-1.notebooks.dev/channel","type":"laravel"}"#,
        )
        .expect("notebook");
        assert_eq!(notebook.id, "nb-1");
        assert_eq!(notebook.okra_url, "wss://nb-1.notebooks.dev/channel");
        assert_eq!(notebook.kind, "laravel");

        let round = serde_json::to_value(&notebook).expect("json");
        assert!(round.get("okraUrl").is_some());
        assert!(round.get("type").is_some());
    }

    #[test]
    fn test_telemetry_gates_user_agent_header() {
        let url = "https://api.example.test/notebook/nb-1";

        let reporting = NotebookClient::new("tok", ClientOptions::default()).expect("client");
        let request = reporting
            .request(reqwest::Method::GET, url)
            .build()
            .expect("request");
        let agent = request
            .headers()
            .get(reqwest::header::USER_AGENT)
            .expect("identity header present by default");
        assert!(agent.to_str().unwrap().starts_with("notebook-sdk/"));

        let opted_out = NotebookClient::new(
            "tok",
            ClientOptions { telemetry: false, ..ClientOptions::default() },
        )
        .expect("client");
        let request = opted_out
            .request(reqwest::Method::GET, url)
            .build()
            .expect("request");
        assert!(!request.headers().contains_key(reqwest::header::USER_AGENT));
    }

    #[tokio::test]
    async fn test_connect_builds_lazy_session() {
        let client = NotebookClient::new("tok", ClientOptions::default()).expect("client");
        let notebook = NotebookData {
            id: "nb-1".into(),
            okra_url: "ws://127.0.0.1:1/channel".into(),
            kind: "laravel".into(),
        };
        let session = client.connect(notebook).expect("session");
        assert_eq!(session.notebook().id, "nb-1");
        session.dispose();
    }
}
