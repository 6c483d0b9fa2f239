//! RPC client: framed transport plus call helpers.
//!
//! [`RpcClient`] owns one connection and serializes calls over it with a
//! request-id counter. The module-level helpers resolve an instance
//! through the registry, connect, and make one call, which is the shape
//! most tooling wants.
//!
//! When auth is required, the client attaches a token bound to the
//! function name as the `_auth_token` keyword argument; the server strips
//! it before the function runs.

use crate::config::settings;
use crate::error::{Result, RpcError};
use crate::instances::{InstanceAddress, InstanceRegistry};
use crate::protocol::{read_message, write_message, RpcRequest, RpcResponse};
use crate::security::{self, AUTH_TOKEN_KEY};
use crate::serialization::Serializer;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Client for one server connection.
pub struct RpcClient {
    address: InstanceAddress,
    stream: Mutex<TcpStream>,
    serializer: Serializer,
    next_id: AtomicU64,
    client_id: String,
}

impl RpcClient {
    /// Connect to an instance address within the configured connect
    /// timeout (`server.connection_timeout_secs`).
    pub async fn connect(address: &InstanceAddress) -> Result<Self> {
        let timeout = settings().server.connect_timeout();
        let connect = TcpStream::connect(address.socket_addr());
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
            .map_err(|e| RpcError::Communication {
                address: address.to_string(),
                message: format!("Failed to connect: {}", e),
            })?;
        debug!("Connected to {}", address);
        Ok(Self {
            address: address.clone(),
            stream: Mutex::new(stream),
            serializer: Serializer::from_settings(),
            next_id: AtomicU64::new(1),
            client_id: default_client_id(),
        })
    }

    /// Replace the client id sent with every request.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn address(&self) -> &InstanceAddress {
        &self.address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Call a remote function. A carried remote error re-raises locally.
    pub async fn call(&self, function: &str, mut kwargs: Map<String, Value>) -> Result<Value> {
        if security::auth_required() {
            kwargs.insert(
                AUTH_TOKEN_KEY.to_string(),
                json!(security::generate_auth_token(function)),
            );
        }
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            function: function.to_string(),
            kwargs,
            client_id: self.client_id.clone(),
        };

        let mut stream = self.stream.lock().await;
        write_message(&mut *stream, &self.serializer, &request).await?;
        let response: RpcResponse = read_message(&mut *stream, &self.serializer).await?;
        drop(stream);

        if response.id != request.id {
            return Err(RpcError::Communication {
                address: self.address.to_string(),
                message: format!(
                    "Response id {} does not match request id {}",
                    response.id, request.id
                ),
            });
        }
        response.into_result()
    }

    /// Run several calls in one round trip.
    ///
    /// Returns one entry per call: `{"status": "success", "result": ...}`
    /// or `{"status": "error", "error": {...}}`. A failing call does not
    /// abort the batch.
    pub async fn batch_call(&self, calls: &[(String, Map<String, Value>)]) -> Result<Vec<Value>> {
        let entries: Vec<Value> = calls
            .iter()
            .map(|(function, kwargs)| {
                let mut kwargs = kwargs.clone();
                // Each sub-call is guarded on its own name, so each one
                // carries its own token.
                if security::auth_required() {
                    kwargs.insert(
                        AUTH_TOKEN_KEY.to_string(),
                        json!(security::generate_auth_token(function)),
                    );
                }
                json!({"function": function, "kwargs": kwargs})
            })
            .collect();
        let mut kwargs = Map::new();
        kwargs.insert("calls".to_string(), json!(entries));

        match self.call("batch_call", kwargs).await? {
            Value::Array(results) => Ok(results),
            other => Err(RpcError::Decode {
                message: format!("batch_call returned a non-array result: {}", other),
            }),
        }
    }
}

fn default_client_id() -> String {
    format!("client-{}", std::process::id())
}

/// Resolve `host_type`/`instance` through the registry and call `function`.
pub async fn call_remote_function(
    registry: &InstanceRegistry,
    host_type: &str,
    instance: Option<&str>,
    function: &str,
    kwargs: Map<String, Value>,
) -> Result<Value> {
    let (_, address) = registry.resolve(host_type, instance)?;
    let client = RpcClient::connect(&address).await?;
    client.call(function, kwargs).await
}

/// Register a function on a remote instance from source text.
///
/// The function becomes callable on that instance under `name` and lives
/// until the remote process exits.
pub async fn register_function_remotely(
    registry: &InstanceRegistry,
    host_type: &str,
    instance: Option<&str>,
    name: &str,
    source: &str,
) -> Result<()> {
    let mut kwargs = Map::new();
    kwargs.insert("name".to_string(), json!(name));
    kwargs.insert("source".to_string(), json!(source));
    call_remote_function(registry, host_type, instance, "register_remote_function", kwargs)
        .await
        .map(|_| ())
}

/// Register a function from source on a remote instance and call it, in
/// one step.
pub async fn remote_call(
    registry: &InstanceRegistry,
    host_type: &str,
    instance: Option<&str>,
    name: &str,
    source: &str,
    kwargs: Map<String, Value>,
) -> Result<Value> {
    register_function_remotely(registry, host_type, instance, name, source).await?;
    call_remote_function(registry, host_type, instance, name, kwargs).await
}

/// Probe an address with the `ping` built-in.
pub async fn ping_instance(address: &InstanceAddress) -> Result<Value> {
    let client = RpcClient::connect(address).await?;
    client.call("ping", Map::new()).await
}

/// Names callable on an instance, built-ins included.
pub async fn list_remote_functions(
    registry: &InstanceRegistry,
    host_type: &str,
    instance: Option<&str>,
) -> Result<Vec<String>> {
    let value =
        call_remote_function(registry, host_type, instance, "list_methods", Map::new()).await?;
    serde_json::from_value(value).map_err(|e| RpcError::Decode {
        message: format!("list_methods returned a malformed result: {}", e),
    })
}

/// Metadata for one function on an instance.
pub async fn describe_remote_function(
    registry: &InstanceRegistry,
    host_type: &str,
    instance: Option<&str>,
    name: &str,
) -> Result<Value> {
    let mut kwargs = Map::new();
    kwargs.insert("name".to_string(), json!(name));
    call_remote_function(registry, host_type, instance, "describe_remote_function", kwargs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RpcServer, ServerContext, ServerOptions};
    use tempfile::tempdir;

    async fn start_server(
        dir: &tempfile::TempDir,
    ) -> (crate::server::ServerHandle, InstanceRegistry) {
        let registry = InstanceRegistry::with_path(dir.path().join("instances.json"));
        let ctx = ServerContext::standalone(vec![]).unwrap();
        ctx.functions.register("add", |kwargs| {
            let a = kwargs.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = kwargs.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        });
        let handle = RpcServer::start(ServerOptions::default(), ctx, registry.clone())
            .await
            .unwrap();
        (handle, registry)
    }

    #[tokio::test]
    async fn test_call_over_loopback() {
        let dir = tempdir().unwrap();
        let (handle, _) = start_server(&dir).await;

        let client = RpcClient::connect(handle.address()).await.unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("a".to_string(), json!(2));
        kwargs.insert("b".to_string(), json!(40));
        assert_eq!(client.call("add", kwargs).await.unwrap(), json!(42));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_reraises() {
        let dir = tempdir().unwrap();
        let (handle, _) = start_server(&dir).await;

        let client = RpcClient::connect(handle.address()).await.unwrap();
        match client.call("no_such_function", Map::new()).await {
            Err(RpcError::Remote { type_name, .. }) => {
                assert_eq!(type_name, "FunctionNotRegistered")
            }
            other => panic!("Expected remote error, got {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_calls_share_connection() {
        let dir = tempdir().unwrap();
        let (handle, _) = start_server(&dir).await;

        let client = RpcClient::connect(handle.address()).await.unwrap();
        for i in 0..5 {
            let mut kwargs = Map::new();
            kwargs.insert("a".to_string(), json!(i));
            kwargs.insert("b".to_string(), json!(0));
            assert_eq!(client.call("add", kwargs).await.unwrap(), json!(i));
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let dead_port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let address = InstanceAddress::new("127.0.0.1", dead_port);

        match RpcClient::connect(&address).await {
            Err(RpcError::Communication { .. }) | Err(RpcError::Timeout(_)) => {}
            other => panic!(
                "Expected connect failure, got {:?}",
                other.map(|c| c.address().clone())
            ),
        }
    }

    #[tokio::test]
    async fn test_registry_resolved_call() {
        let dir = tempdir().unwrap();
        let (handle, registry) = start_server(&dir).await;

        let mut kwargs = Map::new();
        kwargs.insert("a".to_string(), json!(1));
        kwargs.insert("b".to_string(), json!(1));
        let result = call_remote_function(&registry, "standalone", None, "add", kwargs)
            .await
            .unwrap();
        assert_eq!(result, json!(2));

        handle.shutdown().await.unwrap();
    }
}
