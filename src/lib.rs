//! # rookery
//!
//! A service framework that turns an application's request handlers into a
//! fleet-addressable, discoverable, load-balanced process.
//!
//! Hosting a service means handing rookery a map of named processors. The
//! framework binds each one on an ephemeral local port, publishes the live
//! endpoints into a coordination store under a leased per-instance slot,
//! optionally elects a single active instance, and tears the registration
//! down on SIGTERM.
//!
//! ## Key Concepts
//!
//! - **Processor**: an application-supplied request handler plus its
//!   transport kind (HTTP router, middleware engine, gRPC routes, framed
//!   TCP)
//! - **ServBase**: the publisher owning one instance slot and its lease
//! - **DiscoveryClient**: a watcher maintaining a consistent-hash routing
//!   view over all healthy instances of a peer service
//! - **Manual data**: operator-owned weighting and disable overrides, stored
//!   beside (never racing) the instance's own publication
//!
//! ## Architecture
//!
//! - **Server**: orchestrates startup (publisher, logging, backdoor,
//!   leader lock, application init, tracing, binding, publication, signals)
//! - **Registry**: versioned slot layout in the coordination store, kept
//!   alive by a lease refresher
//! - **Discovery**: full-resync watch loop rebuilding the ring on every
//!   revision

pub mod backoff;
pub mod binder;
pub mod config;
pub mod coord;
pub mod discovery;
pub mod registry;
pub mod server;
pub mod telemetry;

mod error;

pub use binder::{Driver, EngineHandle, Processor, ThriftHandler};
pub use config::{CoordBackend, CoordConfig};
pub use discovery::DiscoveryClient;
pub use error::{Error, Result};
pub use registry::{ManualData, ProcessorKind, RegData, ServBase, ServCtrl, ServInfo};
pub use server::{ProcessorMap, Server, ServerArgs, ServerModel};
