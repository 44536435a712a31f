//! Language-server connection multiplexing.
//!
//! All LSP traffic shares the notebook transport; connections are told
//! apart by a caller-chosen session id carried in the topic suffixes
//! `lsp.response.<id>`, `lsp.closed.<id>`, and `lsp.error.<id>`. The id
//! must be unique per notebook — starting a second connection with a live
//! id is rejected.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::Value;
use crate::error::SdkError;
use crate::events::Subscription;
use crate::transport::Transport;

type MessageHandler = Box<dyn Fn(&str) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&Value) + Send + Sync>;
type CloseHandler = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_message: Mutex<Vec<MessageHandler>>,
    on_error: Mutex<Vec<ErrorHandler>>,
    on_close: Mutex<Vec<CloseHandler>>,
}

/// Language-server subsystem facade.
pub struct LspAdapter {
    transport: Arc<Transport>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for LspAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspAdapter").finish_non_exhaustive()
    }
}

impl LspAdapter {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        Self { transport, active: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Start a language-server connection under `id`.
    ///
    /// Listeners for the per-id topics are registered before the
    /// `lsp.start` request is sent.
    ///
    /// # Errors
    ///
    /// [`SdkError::InvalidConfig`] when `id` is already in use on this
    /// session; transport errors from the start invocation (in which case
    /// nothing stays registered).
    pub async fn start(&self, id: &str) -> Result<LspConnection, SdkError> {
        {
            let mut active = self.active.lock().expect("lsp set poisoned");
            if !active.insert(id.to_string()) {
                return Err(SdkError::InvalidConfig(format!(
                    "lsp session id already in use: {id}"
                )));
            }
        }

        let callbacks = Arc::new(Callbacks::default());
        let subs: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let disposed = Arc::new(AtomicBool::new(false));

        let cb = Arc::clone(&callbacks);
        let sub_response = self
            .transport
            .listen(&format!("lsp.response.{id}"), move |data: &Value| {
                let Some(message) = data
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| data.as_str())
                else {
                    log::warn!("dropping lsp response without message");
                    return;
                };
                for handler in cb.on_message.lock().expect("lsp callbacks poisoned").iter() {
                    handler(message);
                }
            });

        let cb = Arc::clone(&callbacks);
        let sub_error = self
            .transport
            .listen(&format!("lsp.error.{id}"), move |data: &Value| {
                for handler in cb.on_error.lock().expect("lsp callbacks poisoned").iter() {
                    handler(data);
                }
            });

        let cb = Arc::clone(&callbacks);
        let close_subs = Arc::clone(&subs);
        let close_disposed = Arc::clone(&disposed);
        let close_active = Arc::clone(&self.active);
        let close_id = id.to_string();
        let sub_closed = self
            .transport
            .listen(&format!("lsp.closed.{id}"), move |_data: &Value| {
                if close_disposed.swap(true, Ordering::SeqCst) {
                    return;
                }
                close_active.lock().expect("lsp set poisoned").remove(&close_id);
                for handler in cb.on_close.lock().expect("lsp callbacks poisoned").iter() {
                    handler();
                }
                close_subs.lock().expect("lsp subs poisoned").clear();
            });

        {
            let mut guard = subs.lock().expect("lsp subs poisoned");
            guard.push(sub_response);
            guard.push(sub_error);
            guard.push(sub_closed);
        }

        if let Err(e) = self
            .transport
            .invoke("lsp.start", Value::map([("id", Value::from(id))]))
            .await
        {
            subs.lock().expect("lsp subs poisoned").clear();
            self.active.lock().expect("lsp set poisoned").remove(id);
            return Err(e);
        }

        Ok(LspConnection {
            id: id.to_string(),
            transport: Arc::clone(&self.transport),
            active: Arc::clone(&self.active),
            callbacks,
            subs,
            disposed,
        })
    }

    /// Ids with live connections on this session.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().expect("lsp set poisoned").iter().cloned().collect()
    }
}

/// One language-server connection.
///
/// Forwards string payloads both ways; disposing the connection issues
/// `lsp.close` and releases the per-id subscriptions.
pub struct LspConnection {
    id: String,
    transport: Arc<Transport>,
    active: Arc<Mutex<HashSet<String>>>,
    callbacks: Arc<Callbacks>,
    subs: Arc<Mutex<Vec<Subscription>>>,
    disposed: Arc<AtomicBool>,
}

impl std::fmt::Debug for LspConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspConnection").field("id", &self.id).finish_non_exhaustive()
    }
}

impl LspConnection {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a handler for server-to-client LSP payloads.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks
            .on_message
            .lock()
            .expect("lsp callbacks poisoned")
            .push(Box::new(handler));
    }

    /// Register a handler for per-connection errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.callbacks
            .on_error
            .lock()
            .expect("lsp callbacks poisoned")
            .push(Box::new(handler));
    }

    /// Register a handler for the server-side close.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks
            .on_close
            .lock()
            .expect("lsp callbacks poisoned")
            .push(Box::new(handler));
    }

    /// Send one client-to-server LSP payload.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; `Closed` after disposal.
    pub async fn send(&self, payload: &str) -> Result<(), SdkError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SdkError::Closed);
        }
        self.transport
            .invoke(
                "lsp.message",
                Value::map([
                    ("id", Value::from(self.id.as_str())),
                    ("message", Value::from(payload)),
                ]),
            )
            .await
            .map(|_| ())
    }

    /// Close the connection: issue `lsp.close` and release the
    /// subscriptions. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the close invocation; local
    /// teardown happens regardless.
    pub async fn close(&self) -> Result<(), SdkError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.subs.lock().expect("lsp subs poisoned").clear();
        self.active.lock().expect("lsp set poisoned").remove(&self.id);
        self.transport
            .invoke("lsp.close", Value::map([("id", Value::from(self.id.as_str()))]))
            .await
            .map(|_| ())
    }
}
