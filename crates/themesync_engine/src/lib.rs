//! # Themesync Engine
//!
//! Keeps a local theme directory and a remote theme in step.
//!
//! This crate provides:
//! - Layered configuration with validation
//! - Ignore rules (globs, literals, `/regex/` entries)
//! - Content-checksum reconciliation with a last-synced ledger
//! - HTTP transport with retry, timeout and client-side rate limiting
//! - Debounced filesystem watching with a polling fallback
//! - A bounded worker pool with per-key serialization
//! - Sessions for one-shot commands and watch mode
//!
//! ## Architecture
//!
//! A session reconciles first, then (in watch mode) turns settled
//! filesystem changes into operations:
//! 1. List both sides and compare checksums against the ledger
//! 2. Execute transfers, then removals, on the worker pool
//! 3. Watch, debounce and upload until cancelled
//!
//! ## Key Invariants
//!
//! - Equal checksums never produce an operation
//! - At most one operation per key is in flight
//! - Removals are dispatched only after every transfer of the batch finished
//! - Ignored paths never reach the differ or the watch stream
//! - Configuration and authentication errors abort the session

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

mod config;
mod differ;
mod error;
mod http;
mod ignore;
mod ledger;
mod limiter;
mod local;
mod policy;
mod pool;
mod session;
mod state;
mod transport;
mod watcher;

pub use config::{
    ConfigLayer, Configuration, PoolConfig, RateLimitConfig, RetryConfig, ThemeId,
    DEFAULT_ENVIRONMENT, ENV_PREFIX, LEDGER_DIR, STORE_DOMAIN_SUFFIX,
};
pub use differ::{
    check_guard, plan_change, plan_removal, reconcile, DiffOptions, Guard, Reconciliation,
};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer, Method, ReqwestClient,
};
pub use ignore::IgnoreFilter;
pub use ledger::Ledger;
pub use limiter::RateLimiter;
pub use local::{read_asset, scan, scan_blocking, Inventory};
pub use policy::{Classifier, PolicyClient};
pub use pool::{OperationOutcome, OperationReport, WorkerPool};
pub use session::{run_all, Command, Invocation, Session};
pub use state::{OperationFailure, SessionEvent, SessionState, SessionStatus, SessionSummary};
pub use transport::{
    HttpTransport, MemoryRemote, RemoteCall, RemoteClient, RemoteMethod, ACCESS_TOKEN_HEADER,
};
pub use watcher::{spawn_debounce, watch, Debouncer, RawChange, WatchOptions, WatchStream};
