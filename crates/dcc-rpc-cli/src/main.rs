//! `dcc-rpc`: command-line tool for the RPC fabric.
//!
//! Talks to running instances through the same client transport the
//! library exposes, and to the shared instance registry directly for the
//! discovery commands.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dcc_rpc_core::api;
use dcc_rpc_core::client;
use dcc_rpc_core::instances::InstanceRegistry;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dcc-rpc", version, about = "Cross-process RPC for DCC pipelines")]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit JSON instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server in the foreground until Ctrl-C
    Start {
        /// Bind host; defaults to the config document's server.host
        #[arg(long)]
        host: Option<String>,

        /// 0 picks an ephemeral port; defaults to server.default_port
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, default_value = "standalone")]
        host_type: String,

        /// Instance name; auto-assigned when omitted
        #[arg(long)]
        name: Option<String>,
    },

    /// List registered instances
    List {
        /// Only show instances of this host type
        host_type: Option<String>,
    },

    /// List host types with at least one registered instance
    Dccs,

    /// Remove one instance from the registry
    Unregister { host_type: String, name: String },

    /// Prune unreachable instances from the registry
    Clean,

    /// Call a function on an instance
    Call {
        host_type: String,
        function: String,

        /// Instance name; first instance of the host type when omitted
        #[arg(long)]
        instance: Option<String>,

        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "{}")]
        kwargs: String,
    },

    /// List everything callable on an instance
    ListFunctions {
        host_type: String,

        #[arg(long)]
        instance: Option<String>,
    },

    /// Show metadata for one function on an instance
    Describe {
        host_type: String,
        function: String,

        #[arg(long)]
        instance: Option<String>,
    },

    /// Register a function on an instance from a source file
    Register {
        host_type: String,
        name: String,

        /// WebAssembly module (text or binary) exporting the function
        source: PathBuf,

        #[arg(long)]
        instance: Option<String>,
    },

    /// Inspect background tasks on an instance
    Tasks {
        host_type: String,

        #[arg(long)]
        instance: Option<String>,

        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Heartbeat-age report for every registered instance
    Status {
        /// Flag instances whose heartbeat is older than this many seconds
        #[arg(long, default_value_t = 60)]
        max_age: u64,

        /// Also prune unreachable instances first
        #[arg(long)]
        clean: bool,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List every task the instance knows about
    List,
    /// Show one task's status and, when finished, its result
    Get { task_id: String },
    /// Cancel a pending task
    Cancel { task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::Start {
            host,
            port,
            host_type,
            name,
        } => {
            let server = &dcc_rpc_core::config::settings().server;
            let host = host.unwrap_or_else(|| server.host.clone());
            let port = port.unwrap_or(server.default_port);
            run_server(&host, port, &host_type, name.as_deref()).await
        }
        Command::List { host_type } => list_instances(host_type.as_deref(), cli.json).await,
        Command::Dccs => dccs(cli.json),
        Command::Unregister { host_type, name } => unregister(&host_type, &name),
        Command::Clean => clean(cli.json).await,
        Command::Call {
            host_type,
            function,
            instance,
            kwargs,
        } => call(&host_type, instance.as_deref(), &function, &kwargs, cli.json).await,
        Command::ListFunctions {
            host_type,
            instance,
        } => list_functions(&host_type, instance.as_deref(), cli.json).await,
        Command::Describe {
            host_type,
            function,
            instance,
        } => describe(&host_type, instance.as_deref(), &function, cli.json).await,
        Command::Register {
            host_type,
            name,
            source,
            instance,
        } => register(&host_type, instance.as_deref(), &name, &source).await,
        Command::Tasks {
            host_type,
            instance,
            command,
        } => tasks(&host_type, instance.as_deref(), command, cli.json).await,
        Command::Status { max_age, clean } => status(max_age, clean, cli.json).await,
    }
}

async fn run_server(host: &str, port: u16, host_type: &str, name: Option<&str>) -> Result<()> {
    let instance_name = api::launch_server(host, port, host_type, name, vec![])
        .await
        .context("Failed to launch server")?;
    println!("Serving as {}/{} (Ctrl-C to stop)", host_type, instance_name);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    api::stop_server().await.context("Shutdown failed")?;
    println!("Stopped");
    Ok(())
}

async fn list_instances(host_type: Option<&str>, as_json: bool) -> Result<()> {
    let instances = api::list_instances(host_type).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }
    if instances.is_empty() {
        println!("No registered instances");
        return Ok(());
    }
    for (host_type, group) in &instances {
        for (name, entry) in group {
            println!("{}/{}  {}", host_type, name, entry.uri);
        }
    }
    Ok(())
}

fn dccs(as_json: bool) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    let host_types: Vec<String> = registry.load().keys().cloned().collect();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&host_types)?);
        return Ok(());
    }
    if host_types.is_empty() {
        println!("No registered instances");
        return Ok(());
    }
    for host_type in host_types {
        println!("{}", host_type);
    }
    Ok(())
}

fn unregister(host_type: &str, name: &str) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    if registry.unregister(host_type, name)? {
        println!("Unregistered {}/{}", host_type, name);
        Ok(())
    } else {
        bail!("No registered instance {}/{}", host_type, name)
    }
}

async fn clean(as_json: bool) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    let removed = registry.cleanup().await?;
    if as_json {
        let entries: Vec<Value> = removed
            .iter()
            .map(|(host_type, name, uri)| {
                json!({"host_type": host_type, "name": name, "uri": uri})
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if removed.is_empty() {
        println!("All registered instances are reachable");
    } else {
        for (host_type, name, uri) in &removed {
            println!("Removed {}/{}  {}", host_type, name, uri);
        }
    }
    Ok(())
}

fn parse_kwargs(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("kwargs is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("kwargs must be a JSON object"),
    }
}

fn print_value(value: &Value, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        match value {
            Value::String(s) => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
    }
    Ok(())
}

async fn call(
    host_type: &str,
    instance: Option<&str>,
    function: &str,
    kwargs: &str,
    as_json: bool,
) -> Result<()> {
    let kwargs = parse_kwargs(kwargs)?;
    let result = api::call_remote_function(host_type, instance, function, kwargs).await?;
    print_value(&result, as_json)
}

async fn list_functions(host_type: &str, instance: Option<&str>, as_json: bool) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    let names = client::list_remote_functions(&registry, host_type, instance).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

async fn describe(
    host_type: &str,
    instance: Option<&str>,
    function: &str,
    as_json: bool,
) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    let described =
        client::describe_remote_function(&registry, host_type, instance, function).await?;
    print_value(&described, as_json)
}

async fn register(
    host_type: &str,
    instance: Option<&str>,
    name: &str,
    source: &PathBuf,
) -> Result<()> {
    let text = std::fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    api::register_function_remotely(host_type, instance, name, &text).await?;
    println!("Registered '{}' on {}", name, host_type);
    Ok(())
}

async fn tasks(
    host_type: &str,
    instance: Option<&str>,
    command: TasksCommand,
    as_json: bool,
) -> Result<()> {
    match command {
        TasksCommand::List => {
            let listed =
                api::call_remote_function(host_type, instance, "list_tasks", Map::new()).await?;
            if as_json {
                return print_value(&listed, true);
            }
            let tasks = listed.as_array().cloned().unwrap_or_default();
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                println!(
                    "{}  {}  {}",
                    task["id"].as_str().unwrap_or("?"),
                    task["status"].as_str().unwrap_or("?"),
                    task["function"].as_str().unwrap_or("?"),
                );
            }
            Ok(())
        }
        TasksCommand::Get { task_id } => {
            let mut kwargs = Map::new();
            kwargs.insert("task_id".to_string(), json!(task_id));
            let status =
                api::call_remote_function(host_type, instance, "get_task_status", kwargs.clone())
                    .await?;
            if status["status"] == json!("done") {
                let result =
                    api::call_remote_function(host_type, instance, "get_task_result", kwargs)
                        .await?;
                print_value(&json!({"status": "done", "result": result}), as_json)
            } else {
                print_value(&status, as_json)
            }
        }
        TasksCommand::Cancel { task_id } => {
            let mut kwargs = Map::new();
            kwargs.insert("task_id".to_string(), json!(task_id));
            let canceled =
                api::call_remote_function(host_type, instance, "cancel_task", kwargs).await?;
            if canceled["canceled"] == json!(true) {
                println!("Canceled {}", task_id);
            } else {
                println!("Task {} was not pending; nothing to cancel", task_id);
            }
            Ok(())
        }
    }
}

async fn status(max_age: u64, clean: bool, as_json: bool) -> Result<()> {
    let registry = InstanceRegistry::open_default()?;
    if clean {
        let removed = registry.cleanup().await?;
        if !as_json {
            for (host_type, name, _) in &removed {
                println!("Removed unreachable {}/{}", host_type, name);
            }
        }
    }

    let now = Utc::now();
    let mut rows = Vec::new();
    let instances = registry.load();
    for (host_type, group) in &instances {
        for (name, entry) in group {
            let age_secs = (now - entry.last_heartbeat).num_seconds().max(0) as u64;
            rows.push(json!({
                "host_type": host_type,
                "name": name,
                "uri": entry.uri,
                "heartbeat_age_secs": age_secs,
                "stale": age_secs > max_age,
            }));
        }
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No registered instances");
        return Ok(());
    }
    for row in rows {
        let marker = if row["stale"] == json!(true) { "  STALE" } else { "" };
        println!(
            "{}/{}  {}  heartbeat {}s ago{}",
            row["host_type"].as_str().unwrap_or("?"),
            row["name"].as_str().unwrap_or("?"),
            row["uri"].as_str().unwrap_or("?"),
            row["heartbeat_age_secs"],
            marker,
        );
    }
    Ok(())
}
