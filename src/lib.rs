//! Notebook SDK - typed client for remote notebook environments.
//!
//! This crate gives a controlling program reliable, bidirectional access
//! to a remote containerised development environment ("notebook") over a
//! persistent duplex channel. High-level operations (spawn a process,
//! watch a path, invoke an action) become framed request/response and
//! subscription traffic; server pushes surface as local events and lazy
//! byte streams.
//!
//! # Architecture
//!
//! ```text
//! NotebookClient ── HTTP ──► management API (create / get / fork / delete)
//!      │
//!      └─► Session ─► Transport ─► ReconnectingSocket ─► notebook
//!              │          │
//!              │          └─ demux ─► EventBus ─► handlers / streams
//!              │
//!              ├─ TerminalAdapter   spawn, I/O streams, exit futures
//!              ├─ FsAdapter         CRUD, search, watch, download
//!              ├─ LspAdapter        per-id language-server connections
//!              └─ Beacon            preview-frame postMessage bridge
//! ```
//!
//! # Modules
//!
//! - [`client`] - management HTTP API and session construction
//! - [`session`] - per-notebook facade and init handshake
//! - [`transport`] - request/response multiplexer, keepalive, retries
//! - [`socket`] - reconnecting duplex WebSocket
//! - [`codec`] - binary frame codec
//! - [`events`] - process-local pub/sub
//! - [`terminal`], [`fs`], [`lsp`] - subsystem adapters
//! - [`beacon`] - preview-frame bridge and navigation history

pub mod beacon;
pub mod client;
pub mod codec;
pub mod constants;
pub mod error;
pub mod events;
pub mod fs;
pub mod lsp;
pub mod session;
pub mod socket;
pub mod terminal;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientOptions, NotebookClient, NotebookData};
pub use codec::Value;
pub use error::{FsErrorKind, SdkError};
pub use events::Subscription;
pub use session::{NotebookInfo, Session, SessionOptions};
pub use terminal::NotebookProcess;
pub use transport::{CallOptions, Health, Transport, TransportOptions, TransportStats};
