//! # kvsync Testkit
//!
//! Test utilities for kvsync.
//!
//! This crate provides:
//! - An in-memory network with drop rules and blackholes
//! - An in-memory multi-version store with content-addressed value slices
//! - Multi-device clusters with ordered teardown
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kvsync_testkit::prelude::*;
//!
//! #[test]
//! fn push_reaches_peer() {
//!     let mut cluster = Cluster::new();
//!     let a = cluster.add_peer("a", fast_config());
//!     let b = cluster.add_peer("b", fast_config());
//!     cluster.connect_all();
//!     a.put("k", "v");
//!     cluster.syncer("a").sync_and_wait(vec!["b".into()], SyncMode::Push).unwrap();
//!     assert_eq!(b.get(b"k").unwrap(), b"v");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod multi_ver_store;
pub mod network;

use std::sync::Once;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::multi_ver_store::*;
    pub use crate::network::*;
    pub use kvsync_engine::MemorySyncStore;
    pub use kvsync_protocol::SyncMode;
}

pub use fixtures::*;
pub use generators::*;
pub use kvsync_engine::MemorySyncStore;
pub use multi_ver_store::*;
pub use network::*;

static TRACING: Once = Once::new();

/// Installs a test log subscriber filtered by `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
