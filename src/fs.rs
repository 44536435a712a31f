//! Filesystem adapter.
//!
//! File CRUD, streaming text search with per-query correlation ids,
//! recursive watches that survive reconnects, and chunked download
//! assembly. Application errors whose payload carries a recognised
//! filesystem `name` are re-thrown as typed [`SdkError::Fs`] errors.
//!
//! Watches are registered in a local map keyed by path; on every
//! reconnect the adapter re-issues `fs.watch` for each live entry, so
//! caller handlers keep firing without re-registration. Disposing a watch
//! detaches the local listener *and* issues `fs.unwatch`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{self, Value};
use crate::constants::{
    SEARCH_CONTEXT_LINES, SEARCH_DEFAULT_EXCLUDES, SEARCH_MAX_RESULTS, SEARCH_PREVIEW_CHARS,
    SEARCH_PREVIEW_LINES,
};
use crate::error::SdkError;
use crate::events::Subscription;
use crate::transport::{Transport, TRANSPORT_OPEN};

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeType {
    /// A new entry appeared.
    Added,
    /// Contents or metadata changed.
    Updated,
    /// The entry is gone.
    Deleted,
}

impl FileChangeType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "added" => Some(Self::Added),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One change delivered to a watch handler.
#[derive(Debug, Clone)]
pub struct FileChange {
    /// Change classification.
    pub change: FileChangeType,
    /// Affected path.
    pub path: String,
    /// Whether the entry is a regular file.
    pub is_file: bool,
    /// Whether the entry still exists after the change.
    pub exists: bool,
    /// Client correlation tag, echoed by the server when set.
    pub correlation_id: Option<String>,
}

impl FileChange {
    fn parse(data: &Value) -> Option<Self> {
        let change = FileChangeType::parse(data.get("type").and_then(Value::as_str)?)?;
        Some(Self {
            change,
            path: data.get("path").and_then(Value::as_str)?.to_string(),
            is_file: data.get("isFile").and_then(Value::as_bool).unwrap_or(true),
            exists: data
                .get("exists")
                .and_then(Value::as_bool)
                .unwrap_or(change != FileChangeType::Deleted),
            correlation_id: data
                .get("correlationId")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Watch registration options.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Watch subdirectories too.
    pub recursive: bool,
    /// Client tag echoed back in change events.
    pub correlation_id: Option<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { recursive: true, correlation_id: None }
    }
}

/// Text search query.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Pattern to search for.
    pub pattern: String,
    /// Correlation id; generated when absent.
    pub id: Option<String>,
}

impl SearchQuery {
    /// Query for a literal pattern.
    #[must_use]
    pub fn pattern(pattern: &str) -> Self {
        Self { pattern: pattern.to_string(), id: None }
    }
}

/// Text search options with server defaults.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Treat the pattern as a regular expression.
    pub regex: bool,
    /// Enable case-insensitive matching.
    pub case_insensitive: bool,
    /// Maximum number of results.
    pub max_results: u32,
    /// Context lines before each match.
    pub before_context: u32,
    /// Context lines after each match.
    pub after_context: u32,
    /// Directory names excluded from the scan.
    pub excludes: Vec<String>,
    /// Preview size: lines per match.
    pub preview_lines: u32,
    /// Preview size: characters per line.
    pub preview_chars: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            regex: false,
            case_insensitive: false,
            max_results: SEARCH_MAX_RESULTS,
            before_context: SEARCH_CONTEXT_LINES,
            after_context: SEARCH_CONTEXT_LINES,
            excludes: SEARCH_DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect(),
            preview_lines: SEARCH_PREVIEW_LINES,
            preview_chars: SEARCH_PREVIEW_CHARS,
        }
    }
}

/// One streamed search match.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SearchMatch {
    /// Matched file path.
    pub path: String,
    /// 1-based line number.
    #[serde(default)]
    pub line: u64,
    /// Preview of the matched line.
    #[serde(default)]
    pub preview: String,
    /// Context lines before the match.
    #[serde(default)]
    pub before: Vec<String>,
    /// Context lines after the match.
    #[serde(default)]
    pub after: Vec<String>,
}

/// Final search result.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SearchResults {
    /// Whether the server truncated the result set.
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
    /// Matches from the server's final batch.
    #[serde(default)]
    pub matches: Vec<SearchMatch>,
}

/// Entry metadata from `stat` / `info`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileStat {
    /// Entry path.
    pub path: String,
    /// Entry kind (`file` or `directory`).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Modification time, epoch milliseconds.
    #[serde(default)]
    pub mtime: Option<i64>,
}

/// One directory listing entry.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Entry kind (`file` or `directory`).
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Result of a line-range read.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RangeRead {
    /// First line actually returned (1-based).
    #[serde(rename = "lineStart", default)]
    pub line_start: u64,
    /// Last line actually returned.
    #[serde(rename = "lineEnd", default)]
    pub line_end: u64,
    /// Text content of the range.
    #[serde(default)]
    pub content: String,
    /// Server-side warning, e.g. a clamped range.
    #[serde(default)]
    pub error: Option<String>,
}

/// Download options.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Correlation id; generated when absent.
    pub id: Option<String>,
    /// Paths excluded from the archive.
    pub exclude: Vec<String>,
}

struct WatchEntry {
    options: WatchOptions,
    _sub: Subscription,
}

/// Filesystem subsystem facade.
pub struct FsAdapter {
    transport: Arc<Transport>,
    watches: Arc<Mutex<HashMap<String, WatchEntry>>>,
    _reopen_sub: Subscription,
}

impl std::fmt::Debug for FsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsAdapter").finish_non_exhaustive()
    }
}

impl FsAdapter {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        let watches: Arc<Mutex<HashMap<String, WatchEntry>>> = Arc::new(Mutex::new(HashMap::new()));

        // Re-issue every live watch after a reconnect. The local listeners
        // survive on the bus, only the server side needs re-registration.
        let rewatch_transport = Arc::clone(&transport);
        let rewatch_map = Arc::clone(&watches);
        let reopen_sub = transport.listen(TRANSPORT_OPEN, move |data: &Value| {
            let reconnect = data.get("reconnect").and_then(Value::as_bool).unwrap_or(false);
            if !reconnect {
                return;
            }
            let entries: Vec<(String, WatchOptions)> = rewatch_map
                .lock()
                .expect("watch map poisoned")
                .iter()
                .map(|(path, entry)| (path.clone(), entry.options.clone()))
                .collect();
            if entries.is_empty() {
                return;
            }
            let transport = Arc::clone(&rewatch_transport);
            tokio::spawn(async move {
                for (path, options) in entries {
                    log::debug!("re-issuing watch for {path}");
                    if let Err(e) = transport.invoke("fs.watch", watch_args(&path, &options)).await
                    {
                        log::warn!("re-watch of {path} failed: {e}");
                    }
                }
            });
        });

        Self { transport, watches, _reopen_sub: reopen_sub }
    }

    // ── CRUD ────────────────────────────────────────────────────────────────

    /// Entry metadata.
    ///
    /// # Errors
    ///
    /// Typed filesystem errors for recognised names, transport errors
    /// otherwise.
    pub async fn info(&self, path: &str) -> Result<FileStat, SdkError> {
        let response = self.call("fs.info", path_args(path)).await?;
        codec::from_value(response)
    }

    /// Entry metadata via `stat`.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn stat(&self, path: &str) -> Result<FileStat, SdkError> {
        let response = self.call("fs.stat", path_args(path)).await?;
        codec::from_value(response)
    }

    /// Whether an entry exists.
    ///
    /// Resolved client-side: a `FileNotFound` error maps to `false`.
    ///
    /// # Errors
    ///
    /// Propagates every error other than `FileNotFound`.
    pub async fn exists(&self, path: &str) -> Result<bool, SdkError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(SdkError::Fs { kind: crate::error::FsErrorKind::FileNotFound, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write raw bytes to a file.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn write(&self, path: &str, contents: &[u8]) -> Result<(), SdkError> {
        self.call(
            "fs.write",
            Value::map([
                ("path", Value::from(path)),
                ("content", Value::Bytes(contents.to_vec())),
            ]),
        )
        .await
        .map(|_| ())
    }

    /// Write a file (text-oriented variant).
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<(), SdkError> {
        self.call(
            "fs.writeFile",
            Value::map([("path", Value::from(path)), ("content", Value::from(contents))]),
        )
        .await
        .map(|_| ())
    }

    /// Read a whole file as bytes.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`]; a payload that is neither bytes nor text
    /// surfaces as `InvalidMessage`.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SdkError> {
        let response = self.call("fs.readFile", path_args(path)).await?;
        response
            .get("content")
            .and_then(Value::as_chunk)
            .or_else(|| response.as_chunk())
            .ok_or_else(|| SdkError::InvalidMessage("readFile response without content".into()))
    }

    /// Read a line range from a file.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn read_file_range(
        &self,
        path: &str,
        line_start: u64,
        line_end: u64,
    ) -> Result<RangeRead, SdkError> {
        let response = self
            .call(
                "fs.readFile",
                Value::map([
                    ("path", Value::from(path)),
                    ("lineStart", Value::Int(line_start as i64)),
                    ("lineEnd", Value::Int(line_end as i64)),
                ]),
            )
            .await?;
        codec::from_value(response)
    }

    /// Create a directory.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn mkdir(&self, path: &str) -> Result<(), SdkError> {
        self.call("fs.mkdir", path_args(path)).await.map(|_| ())
    }

    /// Create a directory (workspace-API name).
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn create_directory(&self, path: &str) -> Result<(), SdkError> {
        self.call("fs.createDirectory", path_args(path)).await.map(|_| ())
    }

    /// Move an entry.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn move_entry(&self, from: &str, to: &str) -> Result<(), SdkError> {
        self.call("fs.move", from_to_args(from, to)).await.map(|_| ())
    }

    /// Rename an entry.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SdkError> {
        self.call("fs.rename", from_to_args(from, to)).await.map(|_| ())
    }

    /// Copy an entry.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn copy(&self, from: &str, to: &str) -> Result<(), SdkError> {
        self.call("fs.copy", from_to_args(from, to)).await.map(|_| ())
    }

    /// Remove an entry.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn remove(&self, path: &str) -> Result<(), SdkError> {
        self.call("fs.remove", path_args(path)).await.map(|_| ())
    }

    /// Delete an entry (workspace-API name).
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn delete(&self, path: &str) -> Result<(), SdkError> {
        self.call("fs.delete", path_args(path)).await.map(|_| ())
    }

    /// List a directory.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>, SdkError> {
        let response = self.call("fs.readDirectory", path_args(path)).await?;
        codec::from_value(response)
    }

    /// Recursive tree listing.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn tree(&self, path: &str) -> Result<serde_json::Value, SdkError> {
        let response = self.call("fs.tree", path_args(path)).await?;
        response
            .into_json()
            .ok_or_else(|| SdkError::InvalidMessage("binary payload in tree response".into()))
    }

    /// One-shot file-name glob with the default exclude list.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn find(&self, query: &str, options: &SearchOptions) -> Result<Vec<String>, SdkError> {
        let response = self
            .call(
                "fs.find",
                Value::map([
                    ("query", Value::from(query)),
                    (
                        "excludes",
                        Value::Array(
                            options.excludes.iter().map(|e| Value::from(e.as_str())).collect(),
                        ),
                    ),
                    ("maxResults", Value::from(options.max_results)),
                ]),
            )
            .await?;
        codec::from_value(response)
    }

    // ── Text search ─────────────────────────────────────────────────────────

    /// Run a text search, collecting matches.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::search_with`].
    pub async fn search(
        &self,
        query: SearchQuery,
        options: SearchOptions,
    ) -> Result<SearchResults, SdkError> {
        self.search_with(query, options, |_| true).await
    }

    /// Run a text search with an incremental match handler.
    ///
    /// Partial results arrive on `fs.text.search.<id>`; the sentinel
    /// `false` marks the end of the stream. Returning `false` from the
    /// handler cancels early by disposing the subscription — the server is
    /// not told, so cancellation is best-effort. The returned future
    /// resolves with the server's final `(hasMore, matches)`.
    ///
    /// # Errors
    ///
    /// Typed filesystem or transport errors from the `fs.textSearch`
    /// invocation.
    pub async fn search_with<F>(
        &self,
        query: SearchQuery,
        options: SearchOptions,
        on_match: F,
    ) -> Result<SearchResults, SdkError>
    where
        F: FnMut(&SearchMatch) -> bool + Send + 'static,
    {
        let id = query
            .id
            .clone()
            .unwrap_or_else(|| format!("search_{:08x}", rand::random::<u32>()));
        let topic = format!("fs.text.search.{id}");

        let handler = Mutex::new(on_match);
        let sub_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&sub_slot);
        let sub = self.transport.listen(&topic, move |data: &Value| {
            if matches!(data, Value::Bool(false)) {
                // End sentinel: the server is done streaming.
                slot.lock().expect("search slot poisoned").take();
                return;
            }
            match codec::from_value::<SearchMatch>(data.clone()) {
                Ok(found) => {
                    let mut on_match = handler.lock().expect("search handler poisoned");
                    let keep_going = (*on_match)(&found);
                    drop(on_match);
                    if !keep_going {
                        slot.lock().expect("search slot poisoned").take();
                    }
                }
                Err(e) => log::warn!("dropping malformed search result: {e}"),
            }
        });
        *sub_slot.lock().expect("search slot poisoned") = Some(sub);

        let args = Value::map([
            ("pattern", Value::from(query.pattern.as_str())),
            ("id", Value::from(id.as_str())),
            ("isRegexp", Value::Bool(options.regex)),
            ("caseInsensitive", Value::Bool(options.case_insensitive)),
            ("maxResults", Value::from(options.max_results)),
            ("beforeContext", Value::from(options.before_context)),
            ("afterContext", Value::from(options.after_context)),
            (
                "excludes",
                Value::Array(options.excludes.iter().map(|e| Value::from(e.as_str())).collect()),
            ),
            (
                "preview",
                Value::map([
                    ("lines", Value::from(options.preview_lines)),
                    ("chars", Value::from(options.preview_chars)),
                ]),
            ),
        ]);

        let result = self.call("fs.textSearch", args).await;
        sub_slot.lock().expect("search slot poisoned").take();
        codec::from_value(result?)
    }

    // ── Watch ───────────────────────────────────────────────────────────────

    /// Watch a path for changes.
    ///
    /// The watch is recorded locally so it survives reconnects: on every
    /// reopen the adapter re-issues `fs.watch` for each live entry.
    /// Watching a path that is already watched replaces the previous
    /// registration.
    ///
    /// # Errors
    ///
    /// Typed filesystem or transport errors from the `fs.watch`
    /// invocation; on failure nothing stays registered.
    pub async fn watch<F>(
        &self,
        path: &str,
        options: WatchOptions,
        on_change: F,
    ) -> Result<WatchHandle, SdkError>
    where
        F: Fn(&FileChange) + Send + Sync + 'static,
    {
        let topic = format!("fs.watch.{path}");
        let sub = self.transport.listen(&topic, move |data: &Value| {
            match FileChange::parse(data) {
                Some(change) => on_change(&change),
                None => log::warn!("dropping malformed watch event"),
            }
        });

        self.watches
            .lock()
            .expect("watch map poisoned")
            .insert(path.to_string(), WatchEntry { options: options.clone(), _sub: sub });

        if let Err(e) = self.call("fs.watch", watch_args(path, &options)).await {
            self.watches.lock().expect("watch map poisoned").remove(path);
            return Err(e);
        }

        Ok(WatchHandle {
            path: path.to_string(),
            transport: Arc::clone(&self.transport),
            watches: Arc::clone(&self.watches),
            disposed: AtomicBool::new(false),
        })
    }

    /// Paths currently watched (test and introspection hook).
    #[must_use]
    pub fn watched_paths(&self) -> Vec<String> {
        self.watches
            .lock()
            .expect("watch map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    // ── Download ────────────────────────────────────────────────────────────

    /// Download the workspace as a concatenated binary blob.
    ///
    /// Chunks are concatenated in arrival order; the server is
    /// responsible for ordering.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn download(&self, options: DownloadOptions) -> Result<Vec<u8>, SdkError> {
        self.download_inner(options, None).await
    }

    /// Download, forwarding each chunk to `on_chunk` instead of
    /// collecting. Resolves with an empty blob on completion.
    ///
    /// # Errors
    ///
    /// See [`FsAdapter::info`].
    pub async fn download_streaming<F>(
        &self,
        options: DownloadOptions,
        on_chunk: F,
    ) -> Result<(), SdkError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.download_inner(options, Some(Box::new(on_chunk))).await.map(|_| ())
    }

    async fn download_inner(
        &self,
        options: DownloadOptions,
        on_chunk: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    ) -> Result<Vec<u8>, SdkError> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| format!("download_{:08x}", rand::random::<u32>()));
        let topic = format!("fs.download.{id}");

        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let sub = self.transport.listen(&topic, move |data: &Value| {
            let chunk = data
                .get("chunk")
                .and_then(Value::as_chunk)
                .or_else(|| data.as_chunk());
            let Some(chunk) = chunk else {
                log::warn!("dropping malformed download chunk");
                return;
            };
            match &on_chunk {
                Some(forward) => forward(&chunk),
                None => sink.lock().expect("download sink poisoned").extend_from_slice(&chunk),
            }
        });

        let args = Value::map([
            ("id", Value::from(id.as_str())),
            (
                "exclude",
                Value::Array(options.exclude.iter().map(|e| Value::from(e.as_str())).collect()),
            ),
        ]);
        let result = self.call("fs.download", args).await;
        drop(sub);
        result?;

        let mut collected = collected.lock().expect("download sink poisoned");
        Ok(std::mem::take(&mut *collected))
    }

    /// Invoke with filesystem error mapping.
    async fn call(&self, action: &str, args: Value) -> Result<Value, SdkError> {
        self.transport.invoke(action, args).await.map_err(SdkError::map_fs)
    }
}

/// Handle to a live watch.
pub struct WatchHandle {
    path: String,
    transport: Arc<Transport>,
    watches: Arc<Mutex<HashMap<String, WatchEntry>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("path", &self.path).finish()
    }
}

impl WatchHandle {
    /// Watched path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stop watching: detach the local listener and issue `fs.unwatch`.
    ///
    /// Idempotent; the local listener is released even when the unwatch
    /// request fails.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the `fs.unwatch` invocation.
    pub async fn dispose(&self) -> Result<(), SdkError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.watches.lock().expect("watch map poisoned").remove(&self.path);
        self.transport
            .invoke("fs.unwatch", Value::map([("path", Value::from(self.path.as_str()))]))
            .await
            .map_err(SdkError::map_fs)
            .map(|_| ())
    }
}

fn path_args(path: &str) -> Value {
    Value::map([("path", Value::from(path))])
}

fn from_to_args(from: &str, to: &str) -> Value {
    Value::map([("from", Value::from(from)), ("to", Value::from(to))])
}

fn watch_args(path: &str, options: &WatchOptions) -> Value {
    let mut opts = vec![("recursive".to_string(), Value::Bool(options.recursive))];
    if let Some(correlation_id) = &options.correlation_id {
        opts.push(("correlationId".to_string(), Value::from(correlation_id.as_str())));
    }
    Value::map([
        ("path", Value::from(path)),
        ("options", Value::map(opts)),
    ])
}
