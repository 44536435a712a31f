//! Terminal / process adapter.
//!
//! `spawn` returns a [`NotebookProcess`] handle owning an input sink, a
//! lazy output stream, and an exit future. Output and close events arrive
//! on per-process subtopics (`terminal.output.<id>`,
//! `terminal.close.<id>`), so no client-side id filtering is needed.
//! Listeners are registered before the spawn request leaves, closing the
//! window where early output could be missed.
//!
//! The adapter also exposes the multiplexed terminal operations (list,
//! create, resize, input, close) that address server-side tasks directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Value};
use crate::error::SdkError;
use crate::events::Subscription;
use crate::transport::Transport;

/// Exit code reported when the process was killed or aborted locally
/// before the server reported a real code.
pub const SYNTHETIC_EXIT: i32 = -1;

/// A server-side terminal task record.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Task {
    /// Server-side task id.
    pub id: String,
    /// Command line the task runs.
    #[serde(default)]
    pub command: Option<String>,
    /// Task kind (e.g. `shell`, `daemon`).
    #[serde(default)]
    pub kind: Option<String>,
    /// Creation timestamp, server-formatted.
    #[serde(default)]
    pub created: Option<String>,
}

/// Options for [`TerminalAdapter::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Client-chosen process id; generated when absent.
    pub id: Option<String>,
    /// Task kind forwarded to the server.
    pub kind: Option<String>,
    /// Cancellation token; firing kills the process.
    pub abort: Option<CancellationToken>,
}

/// Terminal subsystem facade.
#[derive(Debug, Clone)]
pub struct TerminalAdapter {
    transport: Arc<Transport>,
}

impl TerminalAdapter {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Spawn a process and return its handle.
    ///
    /// Output and close listeners are registered before the
    /// `terminal.spawn` request is sent. When `options.abort` is already
    /// cancelled, no request is sent and no listeners are registered; the
    /// handle resolves its exit future with [`SYNTHETIC_EXIT`].
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the spawn invocation.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[&str],
        options: SpawnOptions,
    ) -> Result<NotebookProcess, SdkError> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| format!("proc_{:08x}", rand::random::<u32>()));
        let command_line = render_command(command, args);

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        if options.abort.as_ref().is_some_and(CancellationToken::is_cancelled) {
            let _ = exit_tx.send(Some(SYNTHETIC_EXIT));
            let (output_tx, output_rx) = mpsc::unbounded_channel();
            drop(output_tx);
            return Ok(NotebookProcess {
                id,
                command: command_line,
                kind: options.kind,
                created: None,
                transport: Arc::clone(&self.transport),
                output_rx: Mutex::new(Some(output_rx)),
                output_slot: Arc::new(Mutex::new(None)),
                exit_tx,
                exit_rx,
                subs: Arc::new(Mutex::new(Vec::new())),
                killed: Arc::new(AtomicBool::new(true)),
            });
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Bytes>();
        let output_slot = Arc::new(Mutex::new(Some(output_tx)));
        let subs: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let slot = Arc::clone(&output_slot);
        let sub_output = self
            .transport
            .listen(&format!("terminal.output.{id}"), move |data: &Value| {
                let chunk = data
                    .get("output")
                    .and_then(Value::as_chunk)
                    .or_else(|| data.as_chunk());
                let Some(chunk) = chunk else {
                    log::warn!("terminal output event without payload");
                    return;
                };
                if let Some(tx) = slot.lock().expect("output slot poisoned").as_ref() {
                    let _ = tx.send(Bytes::from(chunk));
                }
            });

        let close_exit = Arc::clone(&exit_tx);
        let close_slot = Arc::clone(&output_slot);
        let close_subs = Arc::clone(&subs);
        let sub_close = self
            .transport
            .listen(&format!("terminal.close.{id}"), move |data: &Value| {
                let code = data
                    .get("exitCode")
                    .and_then(Value::as_i64)
                    .and_then(|n| i32::try_from(n).ok())
                    .unwrap_or(SYNTHETIC_EXIT);
                let _ = close_exit.send(Some(code));
                close_slot.lock().expect("output slot poisoned").take();
                close_subs.lock().expect("subs poisoned").clear();
            });

        {
            let mut guard = subs.lock().expect("subs poisoned");
            guard.push(sub_output);
            guard.push(sub_close);
        }

        let process = NotebookProcess {
            id: id.clone(),
            command: command_line.clone(),
            kind: options.kind.clone(),
            created: None,
            transport: Arc::clone(&self.transport),
            output_rx: Mutex::new(Some(output_rx)),
            output_slot,
            exit_tx,
            exit_rx,
            subs,
            killed: Arc::new(AtomicBool::new(false)),
        };

        if let Some(token) = options.abort.clone() {
            process.watch_abort(token);
        }

        let mut spawn_args = vec![
            ("command".to_string(), Value::from(command_line)),
            ("id".to_string(), Value::from(id)),
        ];
        if !args.is_empty() {
            spawn_args.push((
                "args".to_string(),
                Value::Array(args.iter().map(|a| Value::from(*a)).collect()),
            ));
        }
        if let Some(kind) = &options.kind {
            spawn_args.push(("kind".to_string(), Value::from(kind.as_str())));
        }

        let response = self
            .transport
            .invoke("terminal.spawn", Value::map(spawn_args))
            .await;
        let response = match response {
            Ok(value) => value,
            Err(e) => {
                // Roll the listeners back so nothing lingers on the bus.
                process.release();
                return Err(e);
            }
        };

        // Fold the server's task record into the handle.
        let task: Option<Task> = codec::from_value(response).ok();
        Ok(match task {
            Some(task) => NotebookProcess {
                created: task.created,
                kind: process.kind.clone().or(task.kind),
                ..process
            },
            None => process,
        })
    }

    /// List server-side terminal tasks.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; malformed payloads surface as
    /// `InvalidMessage`.
    pub async fn list(&self) -> Result<Vec<Task>, SdkError> {
        let response = self.transport.invoke("terminal.list", Value::Null).await?;
        codec::from_value(response)
    }

    /// Create a server-side terminal without spawning a process into it.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn create(&self, cols: u16, rows: u16) -> Result<Task, SdkError> {
        let response = self
            .transport
            .invoke(
                "terminal.create",
                Value::map([("cols", Value::from(cols)), ("rows", Value::from(rows))]),
            )
            .await?;
        codec::from_value(response)
    }

    /// Start a previously created terminal task.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn start(&self, id: &str) -> Result<(), SdkError> {
        self.transport
            .invoke("terminal.start", Value::map([("id", Value::from(id))]))
            .await
            .map(|_| ())
    }

    /// Write input to a terminal task by id.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn input(&self, id: &str, chunk: &[u8]) -> Result<(), SdkError> {
        self.transport
            .invoke(
                "terminal.input",
                Value::map([
                    ("id", Value::from(id)),
                    ("input", Value::Bytes(chunk.to_vec())),
                ]),
            )
            .await
            .map(|_| ())
    }

    /// Resize a terminal task by id.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SdkError> {
        self.transport
            .invoke(
                "terminal.resize",
                Value::map([
                    ("id", Value::from(id)),
                    ("cols", Value::from(cols)),
                    ("rows", Value::from(rows)),
                ]),
            )
            .await
            .map(|_| ())
    }

    /// Close a terminal task by id.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn close(&self, id: &str) -> Result<(), SdkError> {
        self.transport
            .invoke("terminal.close", Value::map([("id", Value::from(id))]))
            .await
            .map(|_| ())
    }
}

/// Handle to a spawned process.
///
/// Owns the per-process subscriptions; they are released when the server
/// reports the close, when [`kill`](Self::kill) is called, when the abort
/// token fires, or when the input side is closed. All teardown paths are
/// idempotent.
pub struct NotebookProcess {
    id: String,
    command: String,
    kind: Option<String>,
    created: Option<String>,
    transport: Arc<Transport>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    output_slot: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    subs: Arc<Mutex<Vec<Subscription>>>,
    killed: Arc<AtomicBool>,
}

impl std::fmt::Debug for NotebookProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookProcess")
            .field("id", &self.id)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl NotebookProcess {
    /// Process id used in topic suffixes and terminal actions.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Command line this process runs.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Task kind, when known.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Creation timestamp from the server's task record.
    #[must_use]
    pub fn created(&self) -> Option<&str> {
        self.created.as_deref()
    }

    /// Take the output stream.
    ///
    /// The stream is a lazy, finite, non-restartable sequence of byte
    /// chunks; it ends when the process terminates. Returns `None` if the
    /// stream was already taken.
    pub fn output(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.output_rx.lock().expect("output lock poisoned").take()
    }

    /// Await process termination and return the exit code.
    ///
    /// Resolves with the server-reported code, or [`SYNTHETIC_EXIT`] after
    /// a local kill/abort.
    pub async fn exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return SYNTHETIC_EXIT;
            }
        }
    }

    /// Forward one input chunk to the process.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn write_input(&self, chunk: &[u8]) -> Result<(), SdkError> {
        self.transport
            .invoke(
                "terminal.input",
                Value::map([
                    ("id", Value::from(self.id.as_str())),
                    ("input", Value::Bytes(chunk.to_vec())),
                ]),
            )
            .await
            .map(|_| ())
    }

    /// Close the input side and release the process subscriptions.
    ///
    /// The output stream ends; the server-side process keeps running.
    pub fn close_input(&self) {
        self.release();
    }

    /// Resize the process terminal.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SdkError> {
        self.transport
            .invoke(
                "terminal.resize",
                Value::map([
                    ("id", Value::from(self.id.as_str())),
                    ("cols", Value::from(cols)),
                    ("rows", Value::from(rows)),
                ]),
            )
            .await
            .map(|_| ())
    }

    /// Terminate the process.
    ///
    /// Sends `terminal.close`, releases the subscriptions, and resolves
    /// the exit future with [`SYNTHETIC_EXIT`] if the server has not
    /// reported a code yet. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the close invocation; local
    /// teardown happens regardless.
    pub async fn kill(&self) -> Result<(), SdkError> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.release();
        if self.exit_rx.borrow().is_none() {
            let _ = self.exit_tx.send(Some(SYNTHETIC_EXIT));
        }
        self.transport
            .invoke(
                "terminal.close",
                Value::map([("id", Value::from(self.id.as_str()))]),
            )
            .await
            .map(|_| ())
    }

    /// Drop the bus subscriptions and end the output stream.
    fn release(&self) {
        self.subs.lock().expect("subs poisoned").clear();
        self.output_slot.lock().expect("output slot poisoned").take();
    }

    /// Kill the process when `token` fires; the watcher ends with the
    /// process either way.
    fn watch_abort(&self, token: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let id = self.id.clone();
        let subs = Arc::clone(&self.subs);
        let output_slot = Arc::clone(&self.output_slot);
        let exit_tx = Arc::clone(&self.exit_tx);
        let killed = Arc::clone(&self.killed);
        let mut exit_rx = self.exit_rx.clone();

        tokio::spawn(async move {
            let exited = async {
                loop {
                    if exit_rx.borrow_and_update().is_some() {
                        return;
                    }
                    if exit_rx.changed().await.is_err() {
                        return;
                    }
                }
            };
            tokio::select! {
                () = exited => {}
                () = token.cancelled() => {
                    if killed.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    subs.lock().expect("subs poisoned").clear();
                    output_slot.lock().expect("output slot poisoned").take();
                    let _ = exit_tx.send(Some(SYNTHETIC_EXIT));
                    if let Err(e) = transport
                        .invoke("terminal.close", Value::map([("id", Value::from(id.as_str()))]))
                        .await
                    {
                        log::warn!("abort-kill of process {id} failed: {e}");
                    }
                }
            }
        });
    }
}

fn render_command(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        let mut line = String::from(command);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;

    fn offline_transport() -> Arc<Transport> {
        Arc::new(
            Transport::new("ws://127.0.0.1:1/never".into(), TransportOptions::default())
                .expect("valid options"),
        )
    }

    #[test]
    fn test_render_command() {
        assert_eq!(render_command("ls", &[]), "ls");
        assert_eq!(render_command("printf", &["%s", "hi"]), "printf %s hi");
    }

    #[tokio::test]
    async fn test_spawn_with_fired_abort_never_subscribes() {
        let transport = offline_transport();
        let adapter = TerminalAdapter::new(Arc::clone(&transport));
        let token = CancellationToken::new();
        token.cancel();

        let process = adapter
            .spawn(
                "sleep",
                &["60"],
                SpawnOptions { abort: Some(token), ..SpawnOptions::default() },
            )
            .await
            .expect("aborted spawn resolves locally");

        // Synthetic exit, immediately resolved.
        assert_eq!(process.exit().await, SYNTHETIC_EXIT);

        // No listeners were registered for this process.
        let output_topic = format!("terminal.output.{}", process.id());
        let close_topic = format!("terminal.close.{}", process.id());
        assert_eq!(transport.bus().handler_count(&output_topic), 0);
        assert_eq!(transport.bus().handler_count(&close_topic), 0);

        // The output stream is empty and already closed.
        let mut output = process.output().expect("stream available once");
        assert!(output.recv().await.is_none());
        assert!(process.output().is_none());
        transport.close();
    }

    #[tokio::test]
    async fn test_output_stream_is_single_take() {
        let transport = offline_transport();
        let adapter = TerminalAdapter::new(Arc::clone(&transport));
        let token = CancellationToken::new();
        token.cancel();
        let process = adapter
            .spawn("true", &[], SpawnOptions { abort: Some(token), ..SpawnOptions::default() })
            .await
            .expect("spawn");
        assert!(process.output().is_some());
        assert!(process.output().is_none());
        transport.close();
    }

    #[test]
    fn test_task_deserialization_defaults() {
        let task: Task = serde_json::from_value(serde_json::json!({"id": "t1"})).expect("task");
        assert_eq!(task.id, "t1");
        assert!(task.command.is_none());
        assert!(task.kind.is_none());
        assert!(task.created.is_none());
    }
}
