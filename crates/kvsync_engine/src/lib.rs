//! # kvsync Engine
//!
//! Replica synchronization engine for embedded multi-device key-value
//! stores.
//!
//! This crate provides:
//! - One sync task context per remote device, driven by an explicit state
//!   machine (idle → time sync → ability sync → data sync → finished)
//! - Clock offset negotiation and capability/security negotiation
//! - Watermark-based incremental push, pull and push-pull of entries
//! - Commit history, commit entry and value slice exchange for
//!   multi-version stores
//! - A budgeted inbound message queue and a shared worker pool
//! - The caller-facing [`Syncer`] API
//!
//! ## Architecture
//!
//! The engine sits between the embedding database, which implements the
//! storage traits, and a [`Communicator`] that moves messages between
//! devices. Every operation is split into one target per device. A device
//! runs one target at a time; different devices run in parallel.
//!
//! ## Key Invariants
//!
//! - Entries at or below an acknowledged watermark are never resent
//! - Watermarks only move forward unless a device's data is removed
//! - A missing ack resends the exact same packet, so reapplying it is a no-op
//! - Stale or unexpected acks never move the state machine
//! - A failure with one device never affects the others of an operation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ability_sync;
mod communicator;
mod config;
mod context;
mod data_sync;
mod device_manager;
mod engine;
mod env;
mod error;
mod memory;
mod metadata;
mod multi_ver;
mod operation;
mod permission;
mod queue;
mod state_machine;
mod storage;
mod syncer;
mod task_pool;
mod time_helper;
mod time_sync;

pub use communicator::{Communicator, ConnectCallback, MessageCallback, MockCommunicator};
pub use config::{EngineConfig, RetryConfig, SOFTWARE_VERSION_CURRENT};
pub use device_manager::DeviceManager;
pub use engine::{RemoteDataChangedCallback, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use memory::MemorySyncStore;
pub use metadata::{Metadata, PeerMeta};
pub use operation::{CompleteCallback, FinalizeCallback, StatusMap, SyncOperation, SyncStatus};
pub use permission::{AllowAll, CheckFlag, DeviceDenyList, PermissionChecker};
pub use state_machine::{transition, DataPhase, SyncEvent, SyncState};
pub use storage::{
    MultiVerStorage, SingleVerStorage, StoreInfo, SyncDataBatch, SyncInterface, SyncStore,
};
pub use syncer::{SyncRequest, Syncer};
pub use task_pool::{TaskPool, TimerHandle};
pub use time_helper::{calculate_offset, system_time, TimeHelper, TICKS_PER_MILLISECOND};
