//! # steward-core
//!
//! Core library for steward - a remote-management agent that executes
//! administrator-issued command documents on a managed host.
//!
//! This crate provides the building blocks shared by the agent daemon:
//! the durable document state machine, the bounded task pool with
//! cooperative cancellation, and the error back-off policy that guards
//! calls to the remote message service.
//!
//! ## Features
//!
//! - **Contracts**: serialized command-document and plugin-result model
//! - **Document Store**: crash-tolerant four-folder filesystem state machine
//! - **Task Pool**: bounded workers with submit/cancel-by-key/shutdown
//! - **Stop Policy**: consecutive-error counter with a cooldown window
//! - **Config**: immutable agent configuration record
//!
//! ## Example
//!
//! ```rust,no_run
//! use steward_core::config::AgentConfig;
//! use steward_core::docstore::{DocumentStore, Folder};
//!
//! let config = AgentConfig::default();
//! let store = DocumentStore::new(&config.data_root);
//! let pending = store.enumerate(&config.instance_id, Folder::Pending);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod contracts;
pub mod docstore;
pub mod stoppolicy;
pub mod taskpool;

pub use config::AgentConfig;
pub use contracts::{DocumentState, DocumentStatus, PluginResult};
pub use docstore::{DocumentStore, Folder};
pub use stoppolicy::StopPolicy;
pub use taskpool::{CancelFlag, TaskPool};
