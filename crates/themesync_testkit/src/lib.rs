//! # Themesync Testkit
//!
//! Test utilities for themesync.
//!
//! This crate provides:
//! - Temporary theme directories and matching configurations
//! - An in-process fake store speaking the theme assets API
//! - Property-based test generators using proptest
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use themesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_a_theme() {
//!     let theme = ThemeDir::new().with_file("layout/theme.liquid", "{{ content_for_layout }}");
//!     let store = FakeStore::new(TEST_PASSWORD).with_theme(1, "Dawn", "main");
//!     // ... build a session over `LoopbackClient::new(store)`
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
    pub use crate::store::*;
}

pub use fixtures::*;
pub use generators::*;
pub use store::*;

/// Installs a `tracing` subscriber writing to the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
