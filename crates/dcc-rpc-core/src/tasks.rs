//! Background task manager for long-running calls.
//!
//! A submitted call gets an id immediately and runs on its own tokio task;
//! the caller polls status and fetches the result when done. Lifecycle is
//! `pending -> running -> done | failed`, with `canceled` reachable only
//! from `pending`: cancellation is cooperative and a task that has started
//! running finishes on its own.

use crate::cancel::CancellationToken;
use crate::error::{Result, RpcError};
use crate::functions::{ExecAffinity, RegisteredFunction};
use crate::host::{run_on_pump, HostPump};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Externally visible state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub function: String,
    pub status: TaskStatus,
    /// Present once `status` is `done`.
    pub result: Option<Value>,
    /// Present once `status` is `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
}

/// Tracks every task submitted to this process.
#[derive(Default)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a call for background execution. Returns the task id.
    ///
    /// The body honors the function's thread affinity: a main-thread
    /// function runs through `pump` just as it would on a direct call.
    pub fn submit(
        &self,
        function: RegisteredFunction,
        kwargs: Map<String, Value>,
        pump: Arc<dyn HostPump>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let record = TaskRecord {
            id: id.clone(),
            function: function.name.clone(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.tasks
            .lock()
            .expect("task table lock poisoned")
            .insert(id.clone(), TaskEntry {
                record,
                cancel: cancel.clone(),
            });

        let tasks = Arc::clone(&self.tasks);
        let task_id = id.clone();
        tokio::spawn(async move {
            // A cancel that lands before this task is scheduled wins; the
            // pending -> running transition fails and the body never runs.
            if !begin_running(&tasks, &task_id) {
                return;
            }
            debug!("Task {} running '{}'", task_id, function.name);
            let outcome = if cancel.is_cancelled() {
                Err(RpcError::TaskCancelled)
            } else {
                match function.affinity {
                    ExecAffinity::Any => (function.handler)(&kwargs),
                    ExecAffinity::MainThread => {
                        let handler = Arc::clone(&function.handler);
                        run_on_pump(&*pump, move || handler(&kwargs))
                            .await
                            .and_then(|result| result)
                    }
                }
            };
            finish(&tasks, &task_id, outcome);
        });

        id
    }

    pub fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        let tasks = self.tasks.lock().expect("task table lock poisoned");
        tasks
            .get(task_id)
            .map(|entry| entry.record.status)
            .ok_or_else(|| RpcError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Fetch a finished task's result.
    ///
    /// Errors distinguish unknown ids, tasks still in flight, failed tasks
    /// (carrying the failure message), and canceled tasks.
    pub fn get_result(&self, task_id: &str) -> Result<Value> {
        let tasks = self.tasks.lock().expect("task table lock poisoned");
        let entry = tasks.get(task_id).ok_or_else(|| RpcError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        match entry.record.status {
            TaskStatus::Pending | TaskStatus::Running => Err(RpcError::TaskNotCompleted {
                task_id: task_id.to_string(),
            }),
            TaskStatus::Done => Ok(entry.record.result.clone().unwrap_or(Value::Null)),
            TaskStatus::Failed => Err(RpcError::TaskFailed {
                task_id: task_id.to_string(),
                message: entry
                    .record
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            TaskStatus::Canceled => Err(RpcError::TaskCancelled),
        }
    }

    /// Request cancellation. Returns true only when the task was still
    /// pending and is now canceled; a running or finished task is left
    /// alone and reports false.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        let entry = tasks.get_mut(task_id).ok_or_else(|| RpcError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if entry.record.status != TaskStatus::Pending {
            return Ok(false);
        }
        entry.cancel.cancel();
        entry.record.status = TaskStatus::Canceled;
        entry.record.finished_at = Some(Utc::now());
        Ok(true)
    }

    /// Snapshot of every known task, oldest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let tasks = self.tasks.lock().expect("task table lock poisoned");
        let mut records: Vec<TaskRecord> =
            tasks.values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }
}

fn begin_running(tasks: &Mutex<HashMap<String, TaskEntry>>, task_id: &str) -> bool {
    let mut tasks = tasks.lock().expect("task table lock poisoned");
    match tasks.get_mut(task_id) {
        Some(entry) if entry.record.status == TaskStatus::Pending => {
            entry.record.status = TaskStatus::Running;
            entry.record.started_at = Some(Utc::now());
            true
        }
        _ => false,
    }
}

fn finish(tasks: &Mutex<HashMap<String, TaskEntry>>, task_id: &str, outcome: Result<Value>) {
    let mut tasks = tasks.lock().expect("task table lock poisoned");
    let Some(entry) = tasks.get_mut(task_id) else {
        return;
    };
    entry.record.finished_at = Some(Utc::now());
    match outcome {
        Ok(value) => {
            entry.record.status = TaskStatus::Done;
            entry.record.result = Some(value);
        }
        Err(e) => {
            entry.record.status = TaskStatus::Failed;
            entry.record.error = Some(e.to_string());
        }
    }
}
