//! Request/response and pub/sub multiplexer over the reconnecting socket.
//!
//! One transport owns one socket. Outbound `invoke` calls become framed
//! requests with per-call response and error topics; inbound frames are
//! demultiplexed onto the event bus. The transport also owns keepalive,
//! client-side rate limiting, the disconnected-request queue, retry policy,
//! and the close-code policy:
//!
//! | code | meaning        | action                                    |
//! |------|----------------|-------------------------------------------|
//! | 1000 | normal         | stop, do not reconnect                    |
//! | 1001 | going away     | reconnect                                 |
//! | 1006 | abnormal       | reconnect                                 |
//! | 1008 | policy / rate  | stop, surface rate-limit, drop the queue  |
//! | *    | unknown        | reconnect                                 |
//!
//! Reconnection itself lives in the socket; this layer only decides when a
//! close is final.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Value};
use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT, PING_INTERVAL, PING_INTERVAL_MAX,
    PING_INTERVAL_MIN, PONG_RECONNECT_INTERVALS, PONG_UNHEALTHY_INTERVALS, QUEUE_LIMIT,
    QUEUE_MAX_AGE, RATE_LIMIT_MAX, RATE_LIMIT_WINDOW, RETRY_BACKOFF_BASE, RETRY_BACKOFF_CAP,
    RETRY_BACKOFF_JITTER_MS,
};
use crate::error::SdkError;
use crate::events::{EventBus, Subscription};
use crate::socket::{ReadyState, ReconnectingSocket, SocketEvent, SocketOptions};

/// Server push announcing the client id assigned to this connection.
pub const CLIENT_ID_EVENT: &str = "App.Actions.GetClientId";

/// Server push reporting a container boot failure. Logged and dropped.
pub const BOOT_ERROR_EVENT: &str = "Events.BootError";

/// Local topic emitted on every (re)open, with `{reconnect: bool}` data.
pub const TRANSPORT_OPEN: &str = "transport.open";

/// Local topic emitted once when the transport is permanently closed.
pub const TRANSPORT_CLOSED: &str = "transport.closed";

/// Local topic emitted when an invalid frame or socket error occurs.
pub const TRANSPORT_ERROR: &str = "transport.error";

/// Transport construction options.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Maximum resend attempts for transient connection errors.
    pub max_retries: u32,
    /// Sliding-window rate limit: requests per window.
    pub rate_limit_max: usize,
    /// Sliding-window rate limit: window length.
    pub rate_limit_window: Duration,
    /// Maximum queued requests while disconnected.
    pub queue_limit: usize,
    /// Maximum age of a queued request.
    pub queue_max_age: Duration,
    /// When true, no connection attempt is made until the first
    /// `connect()`/`invoke()`.
    pub start_closed: bool,
    /// Log every outbound request and inbound frame at debug level.
    pub debug: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit_max: RATE_LIMIT_MAX,
            rate_limit_window: RATE_LIMIT_WINDOW,
            queue_limit: QUEUE_LIMIT,
            queue_max_age: QUEUE_MAX_AGE,
            start_closed: true,
            debug: false,
        }
    }
}

impl TransportOptions {
    /// Validate option bounds.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidConfig`] when the ping interval or retry
    /// count is out of range, or the rate/queue limits are zero.
    pub fn validate(&self) -> Result<(), SdkError> {
        if self.ping_interval < PING_INTERVAL_MIN || self.ping_interval > PING_INTERVAL_MAX {
            return Err(SdkError::InvalidConfig(format!(
                "ping interval must be within {PING_INTERVAL_MIN:?}..={PING_INTERVAL_MAX:?}"
            )));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(SdkError::InvalidConfig(format!(
                "max retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.rate_limit_max == 0 || self.rate_limit_window.is_zero() {
            return Err(SdkError::InvalidConfig("rate limit must be non-zero".into()));
        }
        if self.queue_limit == 0 {
            return Err(SdkError::InvalidConfig("queue limit must be non-zero".into()));
        }
        Ok(())
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overall deadline for the call, including queue time and retries.
    pub timeout: Option<Duration>,
    /// Cancellation token; firing aborts the call immediately.
    pub abort: Option<CancellationToken>,
}

/// Snapshot of transport counters.
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Requests sent (including retries and keepalive pings).
    pub messages_sent: u64,
    /// Frames received.
    pub messages_received: u64,
    /// Request failures plus invalid inbound frames.
    pub errors: u64,
    /// Mean response time of successful requests, in milliseconds.
    pub avg_response_ms: f64,
    /// Milliseconds since the last keepalive ping was sent.
    pub last_ping_age_ms: Option<u64>,
    /// Milliseconds since the last keepalive pong was received.
    pub last_pong_age_ms: Option<u64>,
    /// Requests currently parked in the disconnected queue.
    pub queue_depth: usize,
    /// Completed reconnects since construction.
    pub reconnects: u64,
    /// Whether the socket is currently open.
    pub connected: bool,
}

/// Derived connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Connected, responsive, low error rate.
    Healthy,
    /// Connected but slow or error-prone.
    Degraded,
    /// Disconnected, silent, or failing most requests.
    Unhealthy,
}

#[derive(Debug, Clone)]
enum AbortReason {
    ConnectionLost,
    RateLimited(String),
}

#[derive(Debug, Clone)]
enum StopReason {
    Closed,
    RateLimited(String),
}

impl StopReason {
    fn as_error(&self) -> SdkError {
        match self {
            Self::Closed => SdkError::Closed,
            Self::RateLimited(reason) => SdkError::RateLimited(reason.clone()),
        }
    }
}

struct QueuedRequest {
    action: String,
    args: Value,
    enqueued: Instant,
    tx: oneshot::Sender<Result<Value, SdkError>>,
}

#[derive(Default)]
struct MuxState {
    queue: VecDeque<QueuedRequest>,
    limiter: VecDeque<Instant>,
    client_id: Option<String>,
}

#[derive(Default)]
struct StatsInner {
    messages_sent: u64,
    messages_received: u64,
    errors: u64,
    response_total_ms: f64,
    response_count: u64,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    reconnects: u64,
}

struct Inner {
    socket: ReconnectingSocket,
    bus: EventBus<Value>,
    state: Mutex<MuxState>,
    stats: Mutex<StatsInner>,
    stop: Mutex<Option<StopReason>>,
    aborts: broadcast::Sender<AbortReason>,
    token_seq: AtomicU64,
    token_prefix: String,
    connected_once: AtomicBool,
    opts: TransportOptions,
}

/// One outstanding request: response/error one-shots plus the bus
/// subscriptions that feed them. Dropping it releases the subscriptions.
struct InFlight {
    resp_rx: oneshot::Receiver<Value>,
    err_rx: oneshot::Receiver<Value>,
    aborts: broadcast::Receiver<AbortReason>,
    started: Instant,
    _subs: [Subscription; 2],
}

/// Multiplexer over one reconnecting socket.
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.inner.socket.url())
            .field("state", &self.inner.socket.ready_state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport for the given duplex URL.
    ///
    /// With `start_closed` (the default) no connection attempt occurs until
    /// the first `connect()` or `invoke()`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidConfig`] when option validation fails.
    pub fn new(url: String, options: TransportOptions) -> Result<Self, SdkError> {
        options.validate()?;

        let socket = ReconnectingSocket::new(
            url,
            SocketOptions { start_closed: options.start_closed },
        );
        let events = socket
            .take_events()
            .expect("freshly created socket has an event receiver");
        let (aborts, _) = broadcast::channel(64);
        let ping_interval = options.ping_interval;

        let inner = Arc::new(Inner {
            socket,
            bus: EventBus::new(),
            state: Mutex::new(MuxState::default()),
            stats: Mutex::new(StatsInner::default()),
            stop: Mutex::new(None),
            aborts,
            token_seq: AtomicU64::new(1),
            token_prefix: format!("{:08x}", rand::random::<u32>()),
            connected_once: AtomicBool::new(false),
            opts: options,
        });

        tokio::spawn(run_dispatch_loop(Arc::downgrade(&inner), events));
        tokio::spawn(run_keepalive(Arc::downgrade(&inner), ping_interval));

        Ok(Self { inner })
    }

    /// Current socket ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner.socket.ready_state()
    }

    /// Client id assigned by the server, once received.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.state.lock().expect("state lock poisoned").client_id.clone()
    }

    /// Ensure the socket is open.
    ///
    /// Idempotent; concurrent callers coalesce onto the same in-flight
    /// connection attempt.
    ///
    /// # Errors
    ///
    /// `ConnectionTimeout` after 10 s, `Closed`/`RateLimited` when the
    /// transport was permanently stopped.
    pub async fn connect(&self) -> Result<(), SdkError> {
        if let Some(reason) = self.inner.stop.lock().expect("stop lock poisoned").clone() {
            return Err(reason.as_error());
        }
        match self.inner.socket.ready_state() {
            ReadyState::Open => return Ok(()),
            ReadyState::Connecting => {}
            ReadyState::Closed | ReadyState::Closing => self.inner.socket.kick(),
        }

        let mut state_rx = self.inner.socket.watch_state();
        let wait = async {
            loop {
                if *state_rx.borrow() == ReadyState::Open {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(SdkError::Closed);
                }
            }
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(SdkError::ConnectionTimeout),
        }
    }

    /// Revive a stopped transport and reconnect the socket.
    ///
    /// Clears a rate-limit stop; listeners and watch registrations are
    /// preserved (re-registration happens via [`TRANSPORT_OPEN`]).
    ///
    /// # Errors
    ///
    /// Propagates [`Transport::connect`] failures.
    pub async fn reconnect(&self) -> Result<(), SdkError> {
        *self.inner.stop.lock().expect("stop lock poisoned") = None;
        self.inner.socket.reconnect();
        self.connect().await
    }

    /// Invoke a server action and await its response.
    ///
    /// # Errors
    ///
    /// Rejects with the specific [`SdkError`] kind: connection-lost after
    /// retries are exhausted, rate-limit, per-call timeout, abort, typed
    /// application errors, or `Closed` after disposal.
    pub async fn invoke(&self, action: &str, args: Value) -> Result<Value, SdkError> {
        self.invoke_with(action, args, CallOptions::default()).await
    }

    /// Invoke with per-call timeout and abort options.
    ///
    /// # Errors
    ///
    /// See [`Transport::invoke`].
    pub async fn invoke_with(
        &self,
        action: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<Value, SdkError> {
        let inner = &self.inner;

        if let Some(reason) = inner.stop.lock().expect("stop lock poisoned").clone() {
            return Err(reason.as_error());
        }
        if let Some(token) = &options.abort {
            if token.is_cancelled() {
                return Err(SdkError::Aborted);
            }
        }
        check_rate(inner)?;

        let work = async {
            if inner.socket.ready_state() == ReadyState::Open {
                call_with_retries(inner, action.to_string(), args, None).await
            } else {
                // Disconnected: park the request and make sure a connection
                // attempt is underway.
                let (tx, rx) = oneshot::channel();
                {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    if state.queue.len() >= inner.opts.queue_limit {
                        if let Some(oldest) = state.queue.pop_front() {
                            let _ = oldest
                                .tx
                                .send(Err(SdkError::RateLimited("request queue overflow".into())));
                        }
                    }
                    state.queue.push_back(QueuedRequest {
                        action: action.to_string(),
                        args,
                        enqueued: Instant::now(),
                        tx,
                    });
                }
                inner.socket.kick();
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(inner
                        .stop
                        .lock()
                        .expect("stop lock poisoned")
                        .clone()
                        .map_or_else(
                            || SdkError::ConnectionLost("transport closed".into()),
                            |r| r.as_error(),
                        )),
                }
            }
        };

        let abort = options.abort.clone();
        let abort_fired = async move {
            match abort {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match options.timeout {
                Some(t) => match tokio::time::timeout(t, work).await {
                    Ok(result) => result,
                    Err(_) => Err(SdkError::RequestTimeout(action.to_string())),
                },
                None => work.await,
            }
        };

        tokio::select! {
            result = deadline => result,
            () = abort_fired => Err(SdkError::Aborted),
        }
    }

    /// Register a handler for a server push topic.
    pub fn listen<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.on(topic, handler)
    }

    /// Register a one-shot handler for a server push topic.
    pub fn listen_once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.once(topic, handler)
    }

    /// The transport's event bus (adapter internals).
    pub(crate) fn bus(&self) -> &EventBus<Value> {
        &self.inner.bus
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let stats = self.inner.stats.lock().expect("stats lock poisoned");
        let queue_depth = self.inner.state.lock().expect("state lock poisoned").queue.len();
        TransportStats {
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            errors: stats.errors,
            avg_response_ms: if stats.response_count > 0 {
                stats.response_total_ms / stats.response_count as f64
            } else {
                0.0
            },
            last_ping_age_ms: stats.last_ping.map(|t| t.elapsed().as_millis() as u64),
            last_pong_age_ms: stats.last_pong.map(|t| t.elapsed().as_millis() as u64),
            queue_depth,
            reconnects: stats.reconnects,
            connected: self.inner.socket.ready_state() == ReadyState::Open,
        }
    }

    /// Derived health state.
    #[must_use]
    pub fn health(&self) -> Health {
        let stats = self.stats();
        if !stats.connected {
            return Health::Unhealthy;
        }
        let silent_ms =
            u64::from(PONG_UNHEALTHY_INTERVALS) * self.inner.opts.ping_interval.as_millis() as u64;
        let pong_silent = match (stats.last_pong_age_ms, stats.last_ping_age_ms) {
            (Some(pong), _) => pong > silent_ms,
            (None, Some(ping)) => ping > silent_ms,
            (None, None) => false,
        };
        if pong_silent {
            return Health::Unhealthy;
        }
        let error_rate = stats.errors as f64 / stats.messages_sent.max(1) as f64;
        if error_rate > 0.5 {
            return Health::Unhealthy;
        }
        if stats.avg_response_ms > 5000.0 || error_rate > 0.1 {
            return Health::Degraded;
        }
        Health::Healthy
    }

    /// Permanently close the transport.
    ///
    /// Rejects all pending and queued requests with connection-lost,
    /// releases the socket, and emits [`TRANSPORT_CLOSED`]. Subsequent
    /// calls are no-ops.
    pub fn close(&self) {
        stop_with(
            &self.inner,
            StopReason::Closed,
            AbortReason::ConnectionLost,
        );
    }
}

// ─── Request path ──────────────────────────────────────────────────────────

fn check_rate(inner: &Arc<Inner>) -> Result<(), SdkError> {
    let mut state = inner.state.lock().expect("state lock poisoned");
    let now = Instant::now();
    while state
        .limiter
        .front()
        .is_some_and(|t| now.duration_since(*t) >= inner.opts.rate_limit_window)
    {
        state.limiter.pop_front();
    }
    if state.limiter.len() >= inner.opts.rate_limit_max {
        return Err(SdkError::RateLimited("client-side rate limit exceeded".into()));
    }
    state.limiter.push_back(now);
    Ok(())
}

/// Register per-call subscriptions and send the request frame.
///
/// The response topic is `<action>_<token>`, the error topic
/// `<action>_<token>_error`; tokens are unique for the process lifetime.
fn begin_call(inner: &Arc<Inner>, action: &str, args: &Value) -> Result<InFlight, SdkError> {
    let seq = inner.token_seq.fetch_add(1, Ordering::Relaxed);
    let token = format!("{}_{seq}", inner.token_prefix);
    let response_topic = format!("{action}_{token}");
    let error_topic = format!("{action}_{token}_error");

    let (resp_tx, resp_rx) = oneshot::channel();
    let resp_slot = Mutex::new(Some(resp_tx));
    let sub_response = inner.bus.once(&response_topic, move |value: &Value| {
        if let Some(tx) = resp_slot.lock().expect("slot poisoned").take() {
            let _ = tx.send(value.clone());
        }
    });

    let (err_tx, err_rx) = oneshot::channel();
    let err_slot = Mutex::new(Some(err_tx));
    let sub_error = inner.bus.once(&error_topic, move |value: &Value| {
        if let Some(tx) = err_slot.lock().expect("slot poisoned").take() {
            let _ = tx.send(value.clone());
        }
    });

    // Subscribe for close/rate-limit rejection before the frame leaves.
    let aborts = inner.aborts.subscribe();

    let frame = Value::map([
        ("action", Value::from(action)),
        ("responseEvent", Value::from(response_topic)),
        ("errorEvent", Value::from(error_topic)),
        ("data", args.clone()),
    ]);
    inner.socket.send(codec::encode(&frame))?;
    inner.stats.lock().expect("stats lock poisoned").messages_sent += 1;
    if inner.opts.debug {
        log::debug!("-> {action} ({token})");
    }

    Ok(InFlight {
        resp_rx,
        err_rx,
        aborts,
        started: Instant::now(),
        _subs: [sub_response, sub_error],
    })
}

/// Await one of: response, typed error, or connection loss.
async fn finish_call(inner: &Arc<Inner>, mut inflight: InFlight) -> Result<Value, SdkError> {
    let started = inflight.started;
    let result = tokio::select! {
        response = &mut inflight.resp_rx => match response {
            Ok(value) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                let mut stats = inner.stats.lock().expect("stats lock poisoned");
                stats.response_total_ms += elapsed;
                stats.response_count += 1;
                Ok(value)
            }
            Err(_) => Err(SdkError::ConnectionLost("response channel dropped".into())),
        },
        error = &mut inflight.err_rx => match error {
            Ok(value) => Err(parse_api_error(value)),
            Err(_) => Err(SdkError::ConnectionLost("error channel dropped".into())),
        },
        reason = inflight.aborts.recv() => match reason {
            Ok(AbortReason::RateLimited(message)) => Err(SdkError::RateLimited(message)),
            Ok(AbortReason::ConnectionLost) | Err(_) => {
                Err(SdkError::ConnectionLost("connection closed during request".into()))
            }
        },
    };
    if result.is_err() {
        inner.stats.lock().expect("stats lock poisoned").errors += 1;
    }
    result
}

fn parse_api_error(value: Value) -> SdkError {
    let code = value.get("code").and_then(Value::as_i64).unwrap_or(500);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("server error")
        .to_string();
    SdkError::Api { code, message, raw: value }
}

/// Send with retries on transient connection errors.
///
/// Application errors, rate limits, timeouts, and aborts are surfaced
/// unchanged; connection-lost and connection-timeout retry with
/// exponential backoff (1 s base, ×2, 30 s cap, jitter).
async fn call_with_retries(
    inner: &Arc<Inner>,
    action: String,
    args: Value,
    first: Option<InFlight>,
) -> Result<Value, SdkError> {
    let mut attempt: u32 = 0;
    let mut inflight = first;
    loop {
        let result = match inflight.take() {
            Some(call) => finish_call(inner, call).await,
            None => match begin_call(inner, &action, &args) {
                Ok(call) => finish_call(inner, call).await,
                Err(e) => {
                    inner.stats.lock().expect("stats lock poisoned").errors += 1;
                    Err(e)
                }
            },
        };

        match result {
            Err(e) if e.is_retriable() && attempt < inner.opts.max_retries => {
                attempt += 1;
                let exp = RETRY_BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(RETRY_BACKOFF_CAP);
                let jitter =
                    Duration::from_millis(rand::random::<u64>() % RETRY_BACKOFF_JITTER_MS);
                log::debug!(
                    "retrying '{action}' after {e} (attempt {attempt}/{})",
                    inner.opts.max_retries
                );
                tokio::time::sleep(exp + jitter).await;
                if let Some(reason) = inner.stop.lock().expect("stop lock poisoned").clone() {
                    return Err(reason.as_error());
                }
            }
            other => return other,
        }
    }
}

// ─── Inbound dispatch ──────────────────────────────────────────────────────

async fn run_dispatch_loop(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            SocketEvent::Open => on_open(&inner),
            SocketEvent::Message(bytes) => on_message(&inner, &bytes),
            SocketEvent::Close { code, reason } => on_close(&inner, code, reason),
            SocketEvent::Error(message) => {
                log::warn!("socket error: {message}");
                inner.bus.emit(TRANSPORT_ERROR, &Value::Text(message));
            }
        }
    }
    log::debug!("transport dispatch loop exiting");
}

fn on_open(inner: &Arc<Inner>) {
    let reconnect = inner.connected_once.swap(true, Ordering::SeqCst);
    if reconnect {
        inner.stats.lock().expect("stats lock poisoned").reconnects += 1;
    }
    flush_queue(inner);
    inner.bus.emit(
        TRANSPORT_OPEN,
        &Value::map([("reconnect", Value::Bool(reconnect))]),
    );
}

/// Demultiplex one inbound frame per the dispatch rules.
fn on_message(inner: &Arc<Inner>, bytes: &[u8]) {
    inner.stats.lock().expect("stats lock poisoned").messages_received += 1;

    let value = match codec::decode(bytes) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("dropping malformed frame: {e}");
            let mut stats = inner.stats.lock().expect("stats lock poisoned");
            stats.errors += 1;
            drop(stats);
            inner.bus.emit(TRANSPORT_ERROR, &Value::Text(e.to_string()));
            return;
        }
    };

    let Some(event) = value.get("event").and_then(Value::as_str).map(str::to_string) else {
        log::warn!("dropping frame without event field");
        inner.bus.emit(TRANSPORT_ERROR, &Value::Text("frame without event".into()));
        return;
    };
    if inner.opts.debug {
        log::debug!("<- {event} ({} bytes)", bytes.len());
    }
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    match event.as_str() {
        CLIENT_ID_EVENT => {
            let id = data
                .get("id")
                .and_then(Value::as_str)
                .or_else(|| data.as_str())
                .map(str::to_string);
            if let Some(id) = id {
                log::debug!("client id assigned: {id}");
                inner.state.lock().expect("state lock poisoned").client_id = Some(id);
            }
            inner.bus.emit(CLIENT_ID_EVENT, &data);
        }
        BOOT_ERROR_EVENT => {
            log::error!("notebook boot error: {data:?}");
        }
        "response" => {
            let Some(topic) = data.get("responseEvent").and_then(Value::as_str).map(str::to_string)
            else {
                log::warn!("response frame without responseEvent");
                return;
            };
            let payload = data.get("data").cloned().unwrap_or(Value::Null);
            inner.bus.emit(&topic, &payload);
        }
        "error" => {
            let Some(topic) = data.get("errorEvent").and_then(Value::as_str).map(str::to_string)
            else {
                log::warn!("error frame without errorEvent");
                return;
            };
            let payload = data.get("data").cloned().unwrap_or(Value::Null);
            inner.bus.emit(&topic, &payload);
        }
        _ => {
            let topic = value
                .get("as")
                .and_then(Value::as_str)
                .unwrap_or(&event)
                .to_string();
            inner.bus.emit(&topic, &data);
        }
    }
}

fn on_close(inner: &Arc<Inner>, code: u16, reason: String) {
    log::info!("socket closed: code={code} reason={reason:?}");
    match code {
        1000 => {
            // Normal closure: final, no reconnect.
            stop_with(inner, StopReason::Closed, AbortReason::ConnectionLost);
        }
        1008 => {
            // Policy close. Pending requests get the rate-limit error when
            // the reason says so; either way the transport stops and the
            // queue drains.
            let message = if reason.is_empty() { "policy violation".to_string() } else { reason };
            let abort = if message.to_lowercase().contains("rate limit") {
                AbortReason::RateLimited(message.clone())
            } else {
                AbortReason::ConnectionLost
            };
            stop_with(inner, StopReason::RateLimited(message), abort);
        }
        _ => {
            // 1001, 1006, and anything unknown: the socket reconnects on
            // its own; in-flight requests fail over to the retry loop.
            let _ = inner.aborts.send(AbortReason::ConnectionLost);
        }
    }
}

/// Flush queued requests in FIFO order after a (re)connect.
fn flush_queue(inner: &Arc<Inner>) {
    let entries: Vec<QueuedRequest> = {
        let mut state = inner.state.lock().expect("state lock poisoned");
        state.queue.drain(..).collect()
    };
    if entries.is_empty() {
        return;
    }
    log::debug!("flushing {} queued request(s)", entries.len());

    for entry in entries {
        if entry.enqueued.elapsed() > inner.opts.queue_max_age {
            let _ = entry
                .tx
                .send(Err(SdkError::RequestTimeout("queued request expired".into())));
            continue;
        }
        // First send happens inline so FIFO order is preserved on the wire;
        // completion (and any retries) run concurrently.
        match begin_call(inner, &entry.action, &entry.args) {
            Ok(inflight) => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    let result =
                        call_with_retries(&inner, entry.action, entry.args, Some(inflight)).await;
                    let _ = entry.tx.send(result);
                });
            }
            Err(e) => {
                let _ = entry.tx.send(Err(e));
            }
        }
    }
}

fn stop_with(inner: &Arc<Inner>, reason: StopReason, abort: AbortReason) {
    {
        let mut stop = inner.stop.lock().expect("stop lock poisoned");
        if stop.is_some() {
            return;
        }
        *stop = Some(reason);
    }

    let _ = inner.aborts.send(abort.clone());

    let entries: Vec<QueuedRequest> = {
        let mut state = inner.state.lock().expect("state lock poisoned");
        state.queue.drain(..).collect()
    };
    for entry in entries {
        let error = match &abort {
            AbortReason::RateLimited(message) => SdkError::RateLimited(message.clone()),
            AbortReason::ConnectionLost => {
                SdkError::ConnectionLost("transport closed".into())
            }
        };
        let _ = entry.tx.send(Err(error));
    }

    inner.socket.close();
    inner.bus.emit(TRANSPORT_CLOSED, &Value::Null);
}

// ─── Keepalive ─────────────────────────────────────────────────────────────

/// Periodic ping plus queue maintenance.
///
/// A `ping` invocation is issued every interval while the socket is open;
/// when no pong has arrived for [`PONG_RECONNECT_INTERVALS`] intervals a
/// reconnect is forced. Stale queued requests are pruned on every tick.
async fn run_keepalive(weak: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else { break };

        prune_stale_queue(&inner);

        match inner.stop.lock().expect("stop lock poisoned").clone() {
            // A rate-limit stop can be revived by reconnect(); keep ticking.
            Some(StopReason::RateLimited(_)) => continue,
            Some(StopReason::Closed) => break,
            None => {}
        }
        if inner.socket.ready_state() != ReadyState::Open {
            continue;
        }

        inner.stats.lock().expect("stats lock poisoned").last_ping = Some(Instant::now());
        let result = match begin_call(&inner, "ping", &Value::Null) {
            Ok(inflight) => match tokio::time::timeout(interval, finish_call(&inner, inflight)).await
            {
                Ok(result) => result,
                Err(_) => Err(SdkError::RequestTimeout("ping".into())),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                inner.stats.lock().expect("stats lock poisoned").last_pong = Some(Instant::now());
            }
            Err(e) => log::debug!("keepalive ping failed: {e}"),
        }

        let cutoff = interval * PONG_RECONNECT_INTERVALS;
        let silent = {
            let stats = inner.stats.lock().expect("stats lock poisoned");
            match (stats.last_pong, stats.last_ping) {
                (Some(pong), _) => pong.elapsed() > cutoff,
                (None, Some(ping)) => ping.elapsed() > cutoff,
                (None, None) => false,
            }
        };
        if silent && inner.socket.ready_state() == ReadyState::Open {
            log::warn!("no pong for {PONG_RECONNECT_INTERVALS} intervals, forcing reconnect");
            inner.socket.reconnect();
        }
    }
}

fn prune_stale_queue(inner: &Arc<Inner>) {
    let stale: Vec<QueuedRequest> = {
        let mut state = inner.state.lock().expect("state lock poisoned");
        let max_age = inner.opts.queue_max_age;
        let mut kept = VecDeque::with_capacity(state.queue.len());
        let mut expired = Vec::new();
        for entry in state.queue.drain(..) {
            if entry.enqueued.elapsed() > max_age {
                expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        state.queue = kept;
        expired
    };
    for entry in stale {
        let _ = entry
            .tx
            .send(Err(SdkError::RequestTimeout("queued request expired".into())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_transport(options: TransportOptions) -> Arc<Transport> {
        Arc::new(
            Transport::new("ws://127.0.0.1:1/never".into(), options).expect("valid options"),
        )
    }

    #[test]
    fn test_options_validation() {
        let mut opts = TransportOptions::default();
        assert!(opts.validate().is_ok());

        opts.ping_interval = Duration::from_millis(10);
        assert!(matches!(opts.validate(), Err(SdkError::InvalidConfig(_))));

        opts = TransportOptions::default();
        opts.max_retries = MAX_RETRIES_LIMIT + 1;
        assert!(matches!(opts.validate(), Err(SdkError::InvalidConfig(_))));

        opts = TransportOptions::default();
        opts.rate_limit_max = 0;
        assert!(matches!(opts.validate(), Err(SdkError::InvalidConfig(_))));

        opts = TransportOptions::default();
        opts.queue_limit = 0;
        assert!(matches!(opts.validate(), Err(SdkError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_at_construction() {
        let mut opts = TransportOptions::default();
        opts.ping_interval = Duration::ZERO;
        assert!(matches!(
            Transport::new("ws://127.0.0.1:1/x".into(), opts),
            Err(SdkError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_send() {
        let mut opts = TransportOptions::default();
        opts.rate_limit_max = 2;
        let transport = unreachable_transport(opts);

        // Two requests pass the limiter and park in the queue.
        for _ in 0..2 {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.invoke("ping", Value::Null).await });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = transport.invoke("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, SdkError::RateLimited(_)));
        transport.close();
    }

    #[tokio::test]
    async fn test_rate_limit_window_slides() {
        let mut opts = TransportOptions::default();
        opts.rate_limit_max = 1;
        opts.rate_limit_window = Duration::from_millis(50);
        let transport = unreachable_transport(opts);

        // First request takes the only slot.
        let t = Arc::clone(&transport);
        tokio::spawn(async move { t.invoke("ping", Value::Null).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Saturated inside the window…
        let err = transport.invoke("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, SdkError::RateLimited(_)));

        // …but allowed again once the window slides past the first send.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let t = Arc::clone(&transport);
        let accepted = tokio::spawn(async move {
            tokio::time::timeout(
                Duration::from_millis(50),
                t.invoke("ping", Value::Null),
            )
            .await
        });
        // The request passes the limiter and parks in the queue (timeout),
        // rather than being rejected outright.
        let result = accepted.await.expect("task");
        assert!(result.is_err(), "request should park in the queue, not resolve");
        transport.close();
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let mut opts = TransportOptions::default();
        opts.queue_limit = 1;
        let transport = unreachable_transport(opts);

        let t = Arc::clone(&transport);
        let first = tokio::spawn(async move { t.invoke("first.action", Value::Null).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let t = Arc::clone(&transport);
        let _second = tokio::spawn(async move { t.invoke("second.action", Value::Null).await });

        let first_result = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .expect("first rejected promptly")
            .expect("task");
        match first_result {
            Err(SdkError::RateLimited(message)) => assert!(message.contains("overflow")),
            other => panic!("expected queue-overflow rejection, got {other:?}"),
        }
        transport.close();
    }

    #[tokio::test]
    async fn test_stale_queued_request_expires_on_maintenance_tick() {
        let mut opts = TransportOptions::default();
        opts.ping_interval = Duration::from_secs(1);
        opts.queue_max_age = Duration::from_millis(50);
        let transport = unreachable_transport(opts);

        let t = Arc::clone(&transport);
        let queued = tokio::spawn(async move { t.invoke("ping", Value::Null).await });

        // The first keepalive tick prunes the stale entry.
        let result = tokio::time::timeout(Duration::from_secs(5), queued)
            .await
            .expect("expired promptly")
            .expect("task");
        match result {
            Err(SdkError::RequestTimeout(message)) => assert!(message.contains("expired")),
            other => panic!("expected expiry rejection, got {other:?}"),
        }
        transport.close();
    }

    #[tokio::test]
    async fn test_close_rejects_queued_and_fails_fast() {
        let transport = unreachable_transport(TransportOptions::default());

        let t = Arc::clone(&transport);
        let queued = tokio::spawn(async move { t.invoke("ping", Value::Null).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.close();
        transport.close(); // idempotent

        let result = tokio::time::timeout(Duration::from_secs(5), queued)
            .await
            .expect("queued rejected promptly")
            .expect("task");
        assert!(matches!(result, Err(SdkError::ConnectionLost(_))));

        let err = transport.invoke("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, SdkError::Closed));
    }

    #[tokio::test]
    async fn test_closed_transport_emits_transport_closed() {
        let transport = unreachable_transport(TransportOptions::default());
        let (tx, rx) = std::sync::mpsc::channel();
        let _sub = transport.listen(TRANSPORT_CLOSED, move |_| {
            let _ = tx.send(());
        });
        transport.close();
        rx.recv_timeout(Duration::from_secs(1)).expect("closed event");
    }

    #[tokio::test]
    async fn test_pre_aborted_call_fails_immediately() {
        let transport = unreachable_transport(TransportOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = transport
            .invoke_with(
                "ping",
                Value::Null,
                CallOptions { timeout: None, abort: Some(token) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Aborted));
        transport.close();
    }

    #[tokio::test]
    async fn test_abort_mid_queue_wait() {
        let transport = unreachable_transport(TransportOptions::default());
        let token = CancellationToken::new();
        let t = Arc::clone(&transport);
        let token2 = token.clone();
        let call = tokio::spawn(async move {
            t.invoke_with(
                "ping",
                Value::Null,
                CallOptions { timeout: None, abort: Some(token2) },
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("aborted promptly")
            .expect("task");
        assert!(matches!(result, Err(SdkError::Aborted)));
        transport.close();
    }

    #[tokio::test]
    async fn test_call_timeout_while_disconnected() {
        let transport = unreachable_transport(TransportOptions::default());
        let err = transport
            .invoke_with(
                "ping",
                Value::Null,
                CallOptions { timeout: Some(Duration::from_millis(50)), abort: None },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::RequestTimeout(_)));
        transport.close();
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_disconnected() {
        let transport = unreachable_transport(TransportOptions::default());
        assert_eq!(transport.health(), Health::Unhealthy);
        transport.close();
    }

    #[test]
    fn test_parse_api_error_fields() {
        let raw = Value::map([
            ("code", Value::Int(422)),
            ("message", Value::from("validation failed")),
        ]);
        match parse_api_error(raw) {
            SdkError::Api { code, message, .. } => {
                assert_eq!(code, 422);
                assert_eq!(message, "validation failed");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_api_error_defaults() {
        match parse_api_error(Value::Null) {
            SdkError::Api { code, message, .. } => {
                assert_eq!(code, 500);
                assert_eq!(message, "server error");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
