//! steward-daemon - remote-management agent library
//!
//! This library implements the command-processing core of the steward
//! agent: it pulls command messages from the remote message-delivery
//! service, validates and persists them, dispatches them to plugin
//! executors with bounded concurrency, tracks their progress across a
//! durable on-disk state machine, and reports results back. The package
//! configuration engine coordinates mutually-exclusive install, upgrade,
//! and uninstall actions for named software packages on the host.
//!
//! # Modules
//!
//! - [`mds`]: message-delivery-service collaborator contract
//! - [`parser`]: payload parsing and document composition
//! - [`processor`]: orchestration, dispatch, and crash recovery
//! - [`configurepackage`]: package install/upgrade/uninstall engine

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod configurepackage;
pub mod mds;
pub mod parser;
pub mod processor;
