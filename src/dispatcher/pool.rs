use futures::future::join_all;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::cli::config::WorkerMode;
use crate::executor::{TaskError, TaskExecutor, TaskInput};
use crate::protocol::{read_message, write_message, Message, ProtocolError, TaskType};

/// How to start one worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// This binary's `worker` subcommand, forwarding the config file if any
    pub fn current_exe(config: Option<&std::path::Path>) -> std::io::Result<Self> {
        let mut args = Vec::new();
        if let Some(path) = config {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("worker".to_string());

        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }

    fn spawn(&self) -> Result<WorkerProcess, TaskError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaskError::Pool(format!("failed to start worker {}: {}", self.program.display(), e))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TaskError::Pool("worker started without stdio pipes".to_string()));
        };

        debug!("Started worker process {:?}", child.id());

        Ok(WorkerProcess {
            child,
            stdin,
            stdout,
        })
    }
}

/// A live worker speaking the wire protocol over its stdio
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl WorkerProcess {
    async fn exchange(&mut self, request: &Message) -> Result<Option<Message>, ProtocolError> {
        write_message(&mut self.stdin, request).await?;
        read_message(&mut self.stdout).await
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill worker process {:?}: {}", self.child.id(), e);
        }
    }
}

enum Backend {
    /// Jobs run as tokio tasks in this process
    InProcess(Arc<dyn TaskExecutor>),

    /// Jobs run in child processes; idle ones are parked here
    Process {
        command: WorkerCommand,
        idle: Mutex<Vec<WorkerProcess>>,
    },
}

/// Fixed-size pool of job slots.
///
/// Callers beyond capacity queue on the slot semaphore in arrival order; the
/// pool never runs more than `size` jobs at once.
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    backend: Backend,
}

impl WorkerPool {
    /// Pool running `executor` on tokio tasks
    pub fn in_process(size: usize, executor: Arc<dyn TaskExecutor>) -> Self {
        let size = size.max(1);
        info!("Worker pool created with {} in-process slots", size);

        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            backend: Backend::InProcess(executor),
        }
    }

    /// Pool of `size` worker processes, all started up front
    pub fn processes(size: usize, command: WorkerCommand) -> Result<Self, TaskError> {
        let size = size.max(1);

        let workers = (0..size)
            .map(|_| command.spawn())
            .collect::<Result<Vec<_>, _>>()?;

        info!("Worker pool created with {} worker processes", size);

        Ok(Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            backend: Backend::Process {
                command,
                idle: Mutex::new(workers),
            },
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mode(&self) -> WorkerMode {
        match self.backend {
            Backend::InProcess(_) => WorkerMode::InProcess,
            Backend::Process { .. } => WorkerMode::Process,
        }
    }

    /// Slots not currently held by a job
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run one concrete task, waiting for a free slot first.
    ///
    /// `timeout` covers queueing and execution. A job that fails, panics or
    /// crashes its worker only fails this call.
    pub async fn run(
        &self,
        task: TaskType,
        input: TaskInput,
        timeout: Duration,
    ) -> Result<Value, TaskError> {
        if task.is_composite() {
            return Err(TaskError::Unsupported(task));
        }

        let job = async {
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TaskError::Pool("worker pool is closed".to_string()))?;

            match &self.backend {
                Backend::InProcess(executor) => {
                    Self::run_in_process(executor.clone(), permit, task, input).await
                }
                Backend::Process { command, idle } => {
                    Self::run_in_worker(command, idle, permit, task, input).await
                }
            }
        };

        match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} task timed out after {}s", task, timeout.as_secs());
                Err(TaskError::Timeout {
                    task,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn run_in_process(
        executor: Arc<dyn TaskExecutor>,
        permit: OwnedSemaphorePermit,
        task: TaskType,
        input: TaskInput,
    ) -> Result<Value, TaskError> {
        // The spawned job owns the permit, so a caller that gives up on it
        // does not free the slot before the job really ends
        let handle = tokio::spawn(async move {
            let result = executor.execute(task, &input).await;
            drop(permit);
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!("{} task panicked", task);
                Err(TaskError::WorkerCrashed {
                    task,
                    message: panic_message(e.into_panic()),
                })
            }
            Err(e) => Err(TaskError::Pool(e.to_string())),
        }
    }

    async fn run_in_worker(
        command: &WorkerCommand,
        idle: &Mutex<Vec<WorkerProcess>>,
        _permit: OwnedSemaphorePermit,
        task: TaskType,
        input: TaskInput,
    ) -> Result<Value, TaskError> {
        let parked = idle
            .lock()
            .map_err(|_| TaskError::Pool("worker list lock poisoned".to_string()))?
            .pop();

        // Workers lost to crashes or timeouts are replaced here
        let mut worker = match parked {
            Some(worker) => worker,
            None => command.spawn()?,
        };

        let request = Message::request(task, input.url, input.params);

        // If this future is dropped mid-exchange the worker is dropped with
        // it and kill_on_drop reaps the process
        let reply = worker.exchange(&request).await;

        let outcome = match reply {
            Ok(Some(Message::Response { result, .. })) => Ok(result),
            Ok(Some(Message::Error { error_message, .. })) => {
                Err(TaskError::execution(task, error_message))
            }
            Ok(Some(other)) => Err(TaskError::WorkerCrashed {
                task,
                message: format!("unexpected {} reply from worker", other.kind()),
            }),
            Ok(None) => Err(TaskError::WorkerCrashed {
                task,
                message: "worker exited without replying".to_string(),
            }),
            Err(e) => Err(TaskError::WorkerCrashed {
                task,
                message: e.to_string(),
            }),
        };

        let broken = match &outcome {
            Err(TaskError::WorkerCrashed { message, .. }) => {
                error!("Worker running {} task lost: {}", task, message);
                Some(worker)
            }
            _ => match idle.lock() {
                Ok(mut parked) => {
                    parked.push(worker);
                    None
                }
                Err(_) => Some(worker),
            },
        };
        if let Some(worker) = broken {
            worker.kill().await;
        }

        outcome
    }

    /// Stop accepting jobs and kill idle workers
    pub async fn shutdown(&self) {
        self.slots.close();

        if let Backend::Process { idle, .. } = &self.backend {
            let workers = match idle.lock() {
                Ok(mut parked) => std::mem::take(&mut *parked),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            join_all(workers.into_iter().map(WorkerProcess::kill)).await;
        }

        info!("Worker pool shut down");
    }

    /// Pool description returned in pongs
    pub fn describe(&self) -> Map<String, Value> {
        let mut details = Map::new();
        details.insert("pool_size".to_string(), Value::from(self.size));
        details.insert("available_slots".to_string(), Value::from(self.available()));
        details.insert(
            "worker_mode".to_string(),
            serde_json::to_value(self.mode()).unwrap_or(Value::Null),
        );
        details
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
