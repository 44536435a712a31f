//! Per-notebook session facade.
//!
//! A session owns one [`Transport`] bound to one notebook duplex URL and
//! fans out the per-subsystem adapters (terminal, filesystem, language
//! servers). It also runs the init handshake: after a connection is
//! forced, the server pushes `notebook.initialized` with the environment,
//! preview URL, and opened ports.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::client::NotebookData;
use crate::codec::Value;
use crate::constants::{INIT_TIMEOUT, SDK_VERSION};
use crate::error::SdkError;
use crate::events::Subscription;
use crate::fs::FsAdapter;
use crate::lsp::LspAdapter;
use crate::socket::{http_to_ws_scheme, ReadyState};
use crate::terminal::TerminalAdapter;
use crate::transport::{Transport, TransportOptions};

/// Server push carrying the init payload.
pub const INITIALIZED_EVENT: &str = "notebook.initialized";

/// Session construction options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Options forwarded to the owned transport.
    pub transport: TransportOptions,
}

/// Init payload resolved by [`Session::ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookInfo {
    /// Environment variables exposed by the container.
    pub env: BTreeMap<String, String>,
    /// Public preview URL, when the notebook serves HTTP.
    pub preview_url: Option<String>,
    /// Ports currently opened inside the container.
    pub ports: Vec<u16>,
}

/// Client-side facade for one notebook.
pub struct Session {
    notebook: NotebookData,
    transport: Arc<Transport>,
    terminal: TerminalAdapter,
    fs: FsAdapter,
    lsp: LspAdapter,
    init_tx: Arc<watch::Sender<Option<Result<NotebookInfo, SdkError>>>>,
    init_rx: watch::Receiver<Option<Result<NotebookInfo, SdkError>>>,
    _init_sub: Subscription,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("notebook", &self.notebook.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session for a notebook.
    ///
    /// The duplex URL is derived from the notebook's `okraUrl` with the
    /// `sdk_version` query parameter appended. With the default lazy
    /// options no connection occurs until [`ready`](Self::ready) or the
    /// first invoke.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidConfig`] when transport validation fails.
    pub fn new(notebook: NotebookData, options: SessionOptions) -> Result<Self, SdkError> {
        let url = duplex_url(&notebook.okra_url);
        let transport = Arc::new(Transport::new(url, options.transport)?);

        let (init_tx, init_rx) = watch::channel(None);
        let init_tx = Arc::new(init_tx);
        let tx = Arc::clone(&init_tx);
        let init_sub = transport.listen(INITIALIZED_EVENT, move |data| {
            let _ = tx.send(Some(parse_init(data)));
        });

        Ok(Self {
            terminal: TerminalAdapter::new(Arc::clone(&transport)),
            fs: FsAdapter::new(Arc::clone(&transport)),
            lsp: LspAdapter::new(Arc::clone(&transport)),
            notebook,
            transport,
            init_tx,
            init_rx,
            _init_sub: init_sub,
        })
    }

    /// The notebook this session is bound to.
    #[must_use]
    pub fn notebook(&self) -> &NotebookData {
        &self.notebook
    }

    /// The owned transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Terminal / process adapter.
    #[must_use]
    pub fn terminal(&self) -> &TerminalAdapter {
        &self.terminal
    }

    /// Filesystem adapter.
    #[must_use]
    pub fn fs(&self) -> &FsAdapter {
        &self.fs
    }

    /// Language-server adapter.
    #[must_use]
    pub fn lsp(&self) -> &LspAdapter {
        &self.lsp
    }

    /// Await the init handshake.
    ///
    /// Lazy: when the socket is still closed, a `ping` invocation is
    /// issued to force the connection, then the server's
    /// `notebook.initialized` push resolves the future. The result is
    /// cached until [`reconnect`](Self::reconnect).
    ///
    /// # Errors
    ///
    /// [`SdkError::Init`] when the server reports an init failure,
    /// `RequestTimeout` when no init event arrives in time, or any
    /// connection error.
    pub async fn ready(&self) -> Result<NotebookInfo, SdkError> {
        if let Some(state) = self.init_rx.borrow().clone() {
            return state;
        }

        if self.transport.ready_state() != ReadyState::Open {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.invoke("ping", Value::Null).await {
                    log::debug!("init ping failed: {e}");
                }
            });
        }

        let mut rx = self.init_rx.clone();
        let wait = async {
            loop {
                if let Some(state) = rx.borrow_and_update().clone() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return Err(SdkError::Closed);
                }
            }
        };
        match tokio::time::timeout(INIT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(SdkError::RequestTimeout(INITIALIZED_EVENT.into())),
        }
    }

    /// Reconnect the socket and re-run the init handshake.
    ///
    /// Listeners survive: topic subscriptions live on the local bus, and
    /// filesystem watches are re-issued server-side by the fs adapter.
    ///
    /// # Errors
    ///
    /// Propagates connection and init errors.
    pub async fn reconnect(&self) -> Result<NotebookInfo, SdkError> {
        let _ = self.init_tx.send(None);
        self.transport.reconnect().await?;
        self.ready().await
    }

    /// Invoke a server action.
    ///
    /// # Errors
    ///
    /// See [`Transport::invoke`].
    pub async fn invoke(&self, action: &str, args: Value) -> Result<Value, SdkError> {
        self.transport.invoke(action, args).await
    }

    /// Keepalive round-trip.
    ///
    /// # Errors
    ///
    /// See [`Transport::invoke`].
    pub async fn ping(&self) -> Result<Value, SdkError> {
        self.transport.invoke("ping", Value::Null).await
    }

    /// Register a handler for a server push topic.
    pub fn listen<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.transport.listen(topic, handler)
    }

    /// Close the transport and release the session. Idempotent.
    pub fn dispose(&self) {
        self.transport.close();
    }
}

/// Build the duplex URL: ws(s) scheme plus the `sdk_version` parameter.
fn duplex_url(okra_url: &str) -> String {
    let mut url = http_to_ws_scheme(okra_url);
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str("sdk_version=");
    url.push_str(SDK_VERSION);
    url
}

fn parse_init(data: &Value) -> Result<NotebookInfo, SdkError> {
    if data.get("kind").and_then(Value::as_str) == Some("error") {
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("notebook failed to initialize")
            .to_string();
        return Err(SdkError::Init(message));
    }

    let env = data
        .get("env")
        .and_then(Value::as_map)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let preview_url = data
        .get("previewUrl")
        .and_then(Value::as_str)
        .map(str::to_string);
    let ports = data
        .get("ports")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_i64)
                .filter_map(|n| u16::try_from(n).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(NotebookInfo { env, preview_url, ports })
}
