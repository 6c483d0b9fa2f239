//! Cross-process RPC fabric for content-creation tools.
//!
//! Lets processes (DCC applications, headless workers, tooling) expose
//! functions to each other over TCP: each server registers itself in a
//! shared file-backed instance registry, clients discover instances by
//! host type and call functions by name with JSON keyword arguments.
//! Peers can also teach a running server new functions at runtime by
//! sending sandboxed source, and run long calls as background tasks they
//! poll and cancel.
//!
//! Quick tour:
//! - [`api`] — launch/stop the process server, call remote functions.
//! - [`server`] / [`client`] — the underlying transport, for embeddings
//!   that manage their own lifecycle.
//! - [`functions`] — what a process exposes; [`script`] — how peers add
//!   to it remotely.
//! - [`instances`] — discovery; [`tasks`] — background execution;
//!   [`security`] — tokens, ACLs, and feature gates.
//! - [`host`] — running inside a single-threaded DCC main loop.

pub mod api;
pub mod cancel;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod functions;
pub mod host;
pub mod instances;
pub mod paths;
pub mod protocol;
pub mod script;
pub mod security;
pub mod serialization;
pub mod server;
pub mod tasks;

pub use cancel::CancellationToken;
pub use client::RpcClient;
pub use config::{RpcConfig, Settings};
pub use error::{Result, RpcError};
pub use functions::{ExecAffinity, FunctionRegistry, RegisteredFunction};
pub use instances::{InstanceAddress, InstanceRegistry};
pub use server::{RpcServer, ServerContext, ServerHandle, ServerOptions};
pub use tasks::{TaskManager, TaskStatus};
