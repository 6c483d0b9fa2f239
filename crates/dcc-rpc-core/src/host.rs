//! Host adapters: how the server runs inside a DCC application.
//!
//! DCC host APIs are single-threaded; a registered function that touches
//! one must run on the host's main thread. The server core knows nothing
//! about any particular host: it posts main-thread work to a [`HostPump`]
//! and the embedding decides what that means. Inside a DCC the pump is a
//! [`MainThreadQueue`] drained from the host's idle/tick callback; a
//! headless process uses [`StandaloneHost`], which just runs jobs inline.

use crate::error::{Result, RpcError};
use crate::instances::InstanceRegistry;
use crate::server::{RpcServer, ServerContext, ServerHandle, ServerOptions};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A unit of main-thread work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Destination for work that must run on the host's main thread.
pub trait HostPump: Send + Sync {
    fn post(&self, job: Job);
}

/// Run `f` on the pump and await its result.
pub async fn run_on_pump<T, F>(pump: &dyn HostPump, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    pump.post(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx.await
        .map_err(|_| RpcError::Other("Host pump dropped a posted job".to_string()))
}

/// Queue drained by the host's idle/tick callback.
#[derive(Default)]
pub struct MainThreadQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every queued job. Called by the host from its main thread;
    /// returns how many jobs ran.
    pub fn drain(&self) -> usize {
        // Jobs posted while draining wait for the next tick.
        let batch: Vec<Job> = {
            let mut jobs = self.jobs.lock().expect("pump queue lock poisoned");
            jobs.drain(..).collect()
        };
        let count = batch.len();
        for job in batch {
            job();
        }
        count
    }
}

impl HostPump for MainThreadQueue {
    fn post(&self, job: Job) {
        self.jobs
            .lock()
            .expect("pump queue lock poisoned")
            .push_back(job);
    }
}

/// Pump for headless processes with no main-thread constraint.
#[derive(Default)]
pub struct StandaloneHost;

impl HostPump for StandaloneHost {
    fn post(&self, job: Job) {
        job();
    }
}

/// Couples a host-type tag with its pump.
///
/// The tag names the embedding in the instance registry (`"maya"`,
/// `"standalone"`, ...); the pump decides where main-thread functions run.
pub struct HostAdapter {
    host_type: String,
    pump: Arc<dyn HostPump>,
}

impl HostAdapter {
    pub fn new(host_type: impl Into<String>, pump: Arc<dyn HostPump>) -> Self {
        Self {
            host_type: host_type.into(),
            pump,
        }
    }

    /// Adapter for a headless process.
    pub fn standalone() -> Self {
        Self::new("standalone", Arc::new(StandaloneHost))
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn pump(&self) -> Arc<dyn HostPump> {
        Arc::clone(&self.pump)
    }

    /// Start a server for this host: the adapter's host-type tag names the
    /// instance and its pump receives the main-thread work. Stop via
    /// [`ServerHandle::shutdown`], whose ordering (stop accepting, then
    /// unregister, then wind down) must run before the host tears down the
    /// callback that drains the pump.
    pub async fn start_server(
        &self,
        host: &str,
        port: u16,
        instance_name: Option<&str>,
        additional_globals: Vec<String>,
        registry: InstanceRegistry,
    ) -> Result<ServerHandle> {
        let ctx = ServerContext::new(additional_globals, self.pump())?;
        let options = ServerOptions {
            host: host.to_string(),
            port,
            host_type: self.host_type.clone(),
            instance_name: instance_name.map(str::to_string),
        };
        RpcServer::start(options, ctx, registry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_queue_holds_jobs_until_drained() {
        let queue = MainThreadQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            queue.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(queue.drain(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn test_standalone_runs_inline() {
        let host = StandaloneHost;
        let counter = Arc::new(AtomicUsize::new(0));

        let clone = Arc::clone(&counter);
        host.post(Box::new(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_on_pump_returns_result() {
        let pump = StandaloneHost;
        let result = run_on_pump(&pump, || 40 + 2).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_adapter_serves_main_thread_functions_via_pump() {
        use serde_json::json;
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::with_path(dir.path().join("instances.json"));

        let queue = Arc::new(MainThreadQueue::new());
        let adapter = HostAdapter::new("maya", queue.clone());
        let handle = adapter
            .start_server("127.0.0.1", 0, None, vec![], registry)
            .await
            .unwrap();
        assert_eq!(handle.instance_name(), "maya-1");

        handle.context().functions.register_entry(
            crate::functions::RegisteredFunction {
                name: "scene_name".to_string(),
                handler: Arc::new(|_| Ok(json!("shot_010"))),
                affinity: crate::functions::ExecAffinity::MainThread,
                description: None,
            },
        );

        // Fake host idle loop on another thread.
        let drainer = queue.clone();
        let ticking = Arc::new(AtomicUsize::new(1));
        let tick_flag = ticking.clone();
        let idle = std::thread::spawn(move || {
            while tick_flag.load(Ordering::SeqCst) == 1 {
                drainer.drain();
                std::thread::yield_now();
            }
        });

        let client = crate::client::RpcClient::connect(handle.address())
            .await
            .unwrap();
        let result = client
            .call("scene_name", serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!("shot_010"));

        handle.shutdown().await.unwrap();
        ticking.store(0, Ordering::SeqCst);
        idle.join().unwrap();
    }

    #[tokio::test]
    async fn test_run_on_pump_with_queued_pump() {
        let queue = Arc::new(MainThreadQueue::new());

        let drainer = Arc::clone(&queue);
        let pending = run_on_pump(&*queue, || "ticked");

        // Simulate the host's idle callback firing from another thread.
        let handle = std::thread::spawn(move || {
            while drainer.drain() == 0 {
                std::thread::yield_now();
            }
        });

        assert_eq!(pending.await.unwrap(), "ticked");
        handle.join().unwrap();
    }
}
