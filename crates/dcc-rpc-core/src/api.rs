//! High-level entry points.
//!
//! One process runs at most one server, kept in a module-global slot so
//! embeddings with no place to store a handle (a DCC script editor, a
//! startup hook) can launch and stop it by calling free functions. Code
//! that can own the handle should use [`crate::server::RpcServer`]
//! directly instead.
//!
//! The instance registry these helpers use comes from the process-global
//! [`crate::container`]: registering an [`InstanceRegistry`] there reroutes
//! every helper, which is how tests point the api at a scratch file.

use crate::client;
use crate::container;
use crate::error::{Result, RpcError};
use crate::instances::{InstanceMap, InstanceRegistry};
use crate::server::{RpcServer, ServerContext, ServerHandle, ServerOptions};
use serde_json::{Map, Value};
use std::sync::Mutex;

struct RpcRuntime {
    handle: ServerHandle,
}

static RUNTIME: Mutex<Option<RpcRuntime>> = Mutex::new(None);

fn default_registry() -> Result<InstanceRegistry> {
    if let Ok(registry) = container::global().resolve::<InstanceRegistry>() {
        return Ok((*registry).clone());
    }
    InstanceRegistry::open_default()
}

/// Launch the process server and return its instance name.
///
/// `instance_name: None` auto-assigns `{host_type}-{N}`; `port: 0` picks an
/// ephemeral port. Fails if this process already runs a server.
pub async fn launch_server(
    host: &str,
    port: u16,
    host_type: &str,
    instance_name: Option<&str>,
    additional_globals: Vec<String>,
) -> Result<String> {
    let already_running = || RpcError::Other(
        "An RPC server is already running in this process".to_string(),
    );
    if RUNTIME.lock().expect("runtime slot lock poisoned").is_some() {
        return Err(already_running());
    }

    let registry = default_registry()?;
    let ctx = ServerContext::standalone(additional_globals)?;
    let options = ServerOptions {
        host: host.to_string(),
        port,
        host_type: host_type.to_string(),
        instance_name: instance_name.map(str::to_string),
    };
    let handle = RpcServer::start(options, ctx, registry).await?;
    let name = handle.instance_name().to_string();

    let mut slot = RUNTIME.lock().expect("runtime slot lock poisoned");
    if slot.is_some() {
        // Lost a launch race; shut the extra server down.
        drop(slot);
        handle.shutdown().await?;
        return Err(already_running());
    }
    *slot = Some(RpcRuntime { handle });
    Ok(name)
}

/// Stop the process server. Returns false when none is running.
pub async fn stop_server() -> Result<bool> {
    let runtime = RUNTIME
        .lock()
        .expect("runtime slot lock poisoned")
        .take();
    match runtime {
        Some(runtime) => {
            runtime.handle.shutdown().await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Context of the running process server, if any. Used to register local
/// functions after launch.
pub fn server_context() -> Option<ServerContext> {
    RUNTIME
        .lock()
        .expect("runtime slot lock poisoned")
        .as_ref()
        .map(|runtime| runtime.handle.context().clone())
}

/// Call a function on a registered instance.
pub async fn call_remote_function(
    host_type: &str,
    instance: Option<&str>,
    function: &str,
    kwargs: Map<String, Value>,
) -> Result<Value> {
    let registry = default_registry()?;
    client::call_remote_function(&registry, host_type, instance, function, kwargs).await
}

/// Register a function on a registered instance from source text.
pub async fn register_function_remotely(
    host_type: &str,
    instance: Option<&str>,
    name: &str,
    source: &str,
) -> Result<()> {
    let registry = default_registry()?;
    client::register_function_remotely(&registry, host_type, instance, name, source).await
}

/// Register a function from source on an instance and call it, in one
/// step.
pub async fn remote_call(
    host_type: &str,
    instance: Option<&str>,
    name: &str,
    source: &str,
    kwargs: Map<String, Value>,
) -> Result<Value> {
    let registry = default_registry()?;
    client::remote_call(&registry, host_type, instance, name, source, kwargs).await
}

/// Registered instances, pruned of unreachable entries, optionally
/// filtered to one host type.
pub async fn list_instances(host_type: Option<&str>) -> Result<InstanceMap> {
    default_registry()?.list(host_type).await
}
