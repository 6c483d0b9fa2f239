//! RPC server: accept loop, dispatch, and built-in functions.
//!
//! One tokio task accepts connections; each connection gets its own task
//! that reads framed requests and writes framed responses. A watch channel
//! broadcasts shutdown to every task. The server registers itself in the
//! instance registry on start, refreshes its heartbeat on an interval, and
//! unregisters on shutdown.
//!
//! Dispatch order for every request: remote-control gate, auth guard and
//! ACL (discovery built-ins exempt), built-ins, registry lookup,
//! execution. Functions with main-thread affinity run through the host
//! pump; everything else runs inline on the connection task.

use crate::config::{settings, RpcConfig};
use crate::error::{Result, RpcError};
use crate::functions::{ExecAffinity, FunctionRegistry};
use crate::host::{run_on_pump, HostPump, StandaloneHost};
use crate::instances::{InstanceAddress, InstanceRegistry};
use crate::protocol::{read_message, write_message, RpcRequest, RpcResponse};
use crate::security::{self, AccessControl};
use crate::serialization::Serializer;
use crate::tasks::TaskManager;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Names handled by the server itself, before registry lookup.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "ping",
    "list_methods",
    "list_registered_functions",
    "get_globals",
    "batch_call",
    "register_remote_function",
    "describe_remote_function",
    "submit_task",
    "get_task_status",
    "get_task_result",
    "cancel_task",
    "list_tasks",
    "set_env",
    "list_env",
];

/// Built-ins callable without a token even when auth is required:
/// liveness and discovery only. Everything that mutates server state or
/// reaches a registered function goes through the auth guard and ACL.
/// `batch_call` is open because each sub-call re-enters dispatch and is
/// guarded on its own name.
pub const OPEN_BUILTINS: &[&str] = &[
    "ping",
    "list_methods",
    "list_registered_functions",
    "get_globals",
    "describe_remote_function",
    "get_task_status",
    "batch_call",
];

/// How to start a server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub host_type: String,
    /// None auto-assigns `{host_type}-{N}`.
    pub instance_name: Option<String>,
}

impl Default for ServerOptions {
    /// Host and port come from the `server` section of the config
    /// document; callers override them explicitly where needed.
    fn default() -> Self {
        let server = &settings().server;
        Self {
            host: server.host.clone(),
            port: server.default_port,
            host_type: "standalone".to_string(),
            instance_name: None,
        }
    }
}

/// Shared state every connection task dispatches against.
#[derive(Clone)]
pub struct ServerContext {
    pub functions: Arc<FunctionRegistry>,
    pub tasks: Arc<TaskManager>,
    pub acl: Arc<AccessControl>,
    pub serializer: Serializer,
    pub pump: Arc<dyn HostPump>,
}

impl ServerContext {
    pub fn new(additional_globals: Vec<String>, pump: Arc<dyn HostPump>) -> Result<Self> {
        Ok(Self {
            functions: Arc::new(FunctionRegistry::new(additional_globals)?),
            tasks: Arc::new(TaskManager::new()),
            acl: Arc::new(AccessControl::new()),
            serializer: Serializer::from_settings(),
            pump,
        })
    }

    /// Context for a headless process: no main-thread constraint.
    pub fn standalone(additional_globals: Vec<String>) -> Result<Self> {
        Self::new(additional_globals, Arc::new(StandaloneHost))
    }
}

pub struct RpcServer;

impl RpcServer {
    /// Bind, register the instance, and spawn the accept loop and the
    /// heartbeat refresher.
    pub async fn start(
        options: ServerOptions,
        ctx: ServerContext,
        registry: InstanceRegistry,
    ) -> Result<ServerHandle> {
        let listener = TcpListener::bind((options.host.as_str(), options.port))
            .await
            .map_err(|e| RpcError::Communication {
                address: format!("{}:{}", options.host, options.port),
                message: format!("Failed to bind: {}", e),
            })?;
        let local_addr = listener.local_addr()?;
        let address = InstanceAddress::new(options.host.clone(), local_addr.port());

        let instance_name = registry.register(
            &options.host_type,
            options.instance_name.as_deref(),
            &address,
        )?;
        info!(
            "RPC server {}/{} listening at {}",
            options.host_type, instance_name, address
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_ctx = ctx.clone();
        let mut accept_shutdown = shutdown_rx.clone();
        let accept_task = tokio::spawn(async move {
            let connections = Arc::new(Semaphore::new(RpcConfig::MAX_CONNECTIONS));
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("Accept failed: {}", e);
                                continue;
                            }
                        };
                        let Ok(permit) = Arc::clone(&connections).try_acquire_owned() else {
                            warn!("Rejecting {}: connection limit reached", peer);
                            continue;
                        };
                        let ctx = accept_ctx.clone();
                        let mut shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = serve_connection(stream, &ctx, &mut shutdown).await {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                }
            }
        });

        let hb_registry = registry.clone();
        let hb_host_type = options.host_type.clone();
        let hb_name = instance_name.clone();
        let mut hb_shutdown = shutdown_rx;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RpcConfig::HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = hb_shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = hb_registry.update_heartbeat(&hb_host_type, &hb_name) {
                            warn!("Heartbeat update failed: {}", e);
                        }
                    }
                }
            }
        });

        Ok(ServerHandle {
            host_type: options.host_type,
            instance_name,
            local_addr,
            address,
            ctx,
            registry,
            shutdown_tx,
            accept_task,
            heartbeat_task,
        })
    }
}

/// Running server. Dropping it without [`shutdown`](Self::shutdown) leaves
/// the instance registered until the next registry cleanup prunes it.
pub struct ServerHandle {
    host_type: String,
    instance_name: String,
    local_addr: SocketAddr,
    address: InstanceAddress,
    ctx: ServerContext,
    registry: InstanceRegistry,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> &InstanceAddress {
        &self.address
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Stop accepting, unregister the instance, then let the connection
    /// tasks wind down.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        self.registry
            .unregister(&self.host_type, &self.instance_name)?;
        if let Err(e) = self.heartbeat_task.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        info!(
            "RPC server {}/{} stopped",
            self.host_type, self.instance_name
        );
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: &ServerContext,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let request: RpcRequest = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = read_message(&mut reader, &ctx.serializer) => match read {
                Ok(request) => request,
                Err(e) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        };
        let response = dispatch(ctx, request).await;
        write_message(&mut writer, &ctx.serializer, &response).await?;
    }
}

fn is_disconnect(error: &RpcError) -> bool {
    matches!(
        error,
        RpcError::Io {
            source: Some(e),
            ..
        } if matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

async fn dispatch(ctx: &ServerContext, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    debug!("Dispatching '{}' (id {})", request.function, id);
    match handle_request(ctx, request).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(e) => RpcResponse::err(id, &e),
    }
}

async fn handle_request(ctx: &ServerContext, request: RpcRequest) -> Result<Value> {
    if !security::remote_control_enabled() {
        return Err(RpcError::Permission {
            message: "Remote control is disabled on this instance".to_string(),
        });
    }

    let RpcRequest {
        function,
        mut kwargs,
        client_id,
        ..
    } = request;

    if OPEN_BUILTINS.contains(&function.as_str()) {
        // Open built-ins never see the token either.
        kwargs.remove(security::AUTH_TOKEN_KEY);
    } else {
        security::require_auth(&function, &mut kwargs)?;
        if !ctx.acl.check_function_access(&function, &client_id) {
            return Err(RpcError::Permission {
                message: format!("Client '{}' may not call '{}'", client_id, function),
            });
        }
    }

    if let Some(result) = handle_builtin(ctx, &function, &kwargs, &client_id).await? {
        return Ok(result);
    }

    let registered = ctx.functions.get_required(&function)?;
    execute(ctx, registered, kwargs).await
}

async fn execute(
    ctx: &ServerContext,
    function: crate::functions::RegisteredFunction,
    kwargs: Map<String, Value>,
) -> Result<Value> {
    match function.affinity {
        ExecAffinity::Any => (function.handler)(&kwargs),
        ExecAffinity::MainThread => {
            let handler = Arc::clone(&function.handler);
            run_on_pump(&*ctx.pump, move || handler(&kwargs)).await?
        }
    }
}

/// Handle a built-in. `Ok(None)` means the name is not a built-in and
/// dispatch continues to the function registry.
async fn handle_builtin(
    ctx: &ServerContext,
    function: &str,
    kwargs: &Map<String, Value>,
    client_id: &str,
) -> Result<Option<Value>> {
    let result = match function {
        "ping" => json!({"status": "pong"}),

        "list_methods" => {
            let mut names: Vec<String> =
                BUILTIN_FUNCTIONS.iter().map(|s| s.to_string()).collect();
            names.extend(ctx.functions.list());
            names.sort();
            json!(names)
        }

        "list_registered_functions" => json!(ctx.functions.list()),

        "get_globals" => json!(ctx.functions.globals()),

        "batch_call" => {
            let calls = kwargs
                .get("calls")
                .and_then(Value::as_array)
                .ok_or_else(|| RpcError::Validation {
                    param: "calls".to_string(),
                    message: "expected an array of {function, kwargs}".to_string(),
                })?;
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let sub = RpcRequest {
                    id: 0,
                    function: str_field(call, "function")?,
                    kwargs: map_field(call, "kwargs"),
                    client_id: client_id.to_string(),
                };
                // One failing call does not abort the batch.
                let entry = match Box::pin(handle_request(ctx, sub)).await {
                    Ok(value) => json!({"status": "success", "result": value}),
                    Err(e) => json!({"status": "error", "error": {
                        "code": e.to_rpc_error_code(),
                        "message": e.to_string(),
                        "type": e.type_name(),
                    }}),
                };
                results.push(entry);
            }
            json!(results)
        }

        "register_remote_function" => {
            let name = str_arg(kwargs, "name")?;
            let source = str_arg(kwargs, "source")?;
            ctx.functions.register_source(&name, source.as_bytes())?;
            json!({"registered": name})
        }

        "describe_remote_function" => {
            let name = str_arg(kwargs, "name")?;
            ctx.functions.describe(&name)
        }

        "submit_task" => {
            let name = str_arg(kwargs, "function")?;
            // The target function keeps its own ACL even when reached
            // through the task manager.
            if !ctx.acl.check_function_access(&name, client_id) {
                return Err(RpcError::Permission {
                    message: format!("Client '{}' may not call '{}'", client_id, name),
                });
            }
            let registered = ctx.functions.get_required(&name)?;
            let task_kwargs = kwargs
                .get("kwargs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let task_id = ctx
                .tasks
                .submit(registered, task_kwargs, Arc::clone(&ctx.pump));
            json!({"task_id": task_id})
        }

        "get_task_status" => {
            let task_id = str_arg(kwargs, "task_id")?;
            match ctx.tasks.get_status(&task_id) {
                Ok(status) => json!({"status": status}),
                Err(RpcError::TaskNotFound { .. }) => json!({"status": "unknown"}),
                Err(e) => return Err(e),
            }
        }

        "get_task_result" => {
            let task_id = str_arg(kwargs, "task_id")?;
            ctx.tasks.get_result(&task_id)?
        }

        "cancel_task" => {
            let task_id = str_arg(kwargs, "task_id")?;
            json!({"canceled": ctx.tasks.cancel(&task_id)?})
        }

        "list_tasks" => serde_json::to_value(ctx.tasks.list())?,

        "set_env" => {
            require_env_control()?;
            let name = str_arg(kwargs, "name")?;
            let value = str_arg(kwargs, "value")?;
            std::env::set_var(&name, &value);
            json!({"set": name})
        }

        "list_env" => {
            require_env_control()?;
            let prefix = kwargs.get("prefix").and_then(Value::as_str);
            let vars: Map<String, Value> = std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .filter(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
                .map(|(k, v)| (k, json!(v)))
                .collect();
            Value::Object(vars)
        }

        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn require_env_control() -> Result<()> {
    if security::env_control_enabled() {
        Ok(())
    } else {
        Err(RpcError::Permission {
            message: "Environment control is disabled on this instance".to_string(),
        })
    }
}

fn str_arg(kwargs: &Map<String, Value>, key: &str) -> Result<String> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Validation {
            param: key.to_string(),
            message: "expected a string".to_string(),
        })
}

fn str_field(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Validation {
            param: key.to_string(),
            message: "expected a string".to_string(),
        })
}

fn map_field(value: &Value, key: &str) -> Map<String, Value> {
    value
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
