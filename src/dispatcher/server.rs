use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use crate::executor::{TaskError, TaskInput};
use crate::protocol::{read_message, write_message, Message, ProtocolError, TaskType};

/// Routes validated requests to the worker pool
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    task_timeout: Duration,
    read_timeout: Duration,
    shutdown_grace: Duration,
}

fn elapsed_ms(started: Instant) -> Value {
    Value::from(started.elapsed().as_millis() as u64)
}

impl Dispatcher {
    pub fn new(pool: Arc<WorkerPool>, task_timeout: Duration) -> Self {
        Self {
            pool,
            task_timeout,
            read_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(90),
        }
    }

    /// Deadline for a peer to deliver its whole request
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// How long shutdown waits for in-flight connections
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Produce the single reply for one inbound message
    pub async fn handle(&self, message: Message) -> Message {
        match message {
            Message::Request {
                task_type,
                url,
                params,
                ..
            } => {
                let input = TaskInput::new(url, params);
                if task_type.is_composite() {
                    self.run_all(input).await
                } else {
                    self.run_single(task_type, input).await
                }
            }
            Message::Ping { .. } => Message::pong(self.pool.describe()),
            other => Message::error(format!("Unexpected {} message", other.kind()), None),
        }
    }

    async fn run_single(&self, task: TaskType, input: TaskInput) -> Message {
        let started = Instant::now();
        let url = input.url.clone();

        match self.pool.run(task, input, self.task_timeout).await {
            Ok(result) => {
                info!("{} task for {} done in {:?}", task, url, started.elapsed());
                let mut metadata = Map::new();
                metadata.insert("elapsed_ms".to_string(), elapsed_ms(started));
                Message::response(task, result, metadata)
            }
            Err(e) => {
                error!("{} task for {} failed: {}", task, url, e);
                Message::error(e.to_string(), Some(task))
            }
        }
    }

    /// Fan out every concrete task; any failure fails the whole batch
    async fn run_all(&self, input: TaskInput) -> Message {
        let started = Instant::now();
        info!("Running all tasks for {}", input.url);

        let mut jobs = JoinSet::new();
        for task in TaskType::CONCRETE {
            let pool = self.pool.clone();
            let input = input.clone();
            let task_timeout = self.task_timeout;
            jobs.spawn(async move { (task, pool.run(task, input, task_timeout).await) });
        }

        let mut merged = Map::new();
        while let Some(joined) = jobs.join_next().await {
            let failure = match joined {
                Ok((task, Ok(result))) => {
                    debug!("{} sub-task for {} finished", task, input.url);
                    merged.insert(task.as_str().to_string(), result);
                    continue;
                }
                Ok((task, Err(e))) => (Some(task), e),
                Err(e) => (None, TaskError::Pool(e.to_string())),
            };

            // Remaining sub-tasks are abandoned rather than reported partially
            jobs.abort_all();

            let (task, e) = failure;
            error!("All-tasks run for {} failed: {}", input.url, e);

            let mut message = Message::error(e.to_string(), Some(TaskType::All));
            if let Message::Error { details, .. } = &mut message {
                if let Some(task) = task {
                    details.insert("failed_task".to_string(), Value::from(task.as_str()));
                }
                details.insert("elapsed_ms".to_string(), elapsed_ms(started));
            }
            return message;
        }

        let mut metadata = Map::new();
        metadata.insert("elapsed_ms".to_string(), elapsed_ms(started));
        metadata.insert(
            "tasks".to_string(),
            Value::from(
                TaskType::CONCRETE
                    .iter()
                    .map(|task| task.as_str())
                    .collect::<Vec<_>>(),
            ),
        );

        info!("All tasks for {} done in {:?}", input.url, started.elapsed());
        Message::response(TaskType::All, Value::Object(merged), metadata)
    }

    /// Serve one connection: read one message, reply once, close.
    ///
    /// Protocol and validation failures are answered with an `Error` instead
    /// of dropping the connection. A peer that has not delivered its request
    /// within the read timeout is disconnected without a reply.
    pub async fn serve_connection<S>(&self, mut stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read = match timeout(self.read_timeout, read_message(&mut stream)).await {
            Ok(read) => read,
            Err(_) => {
                warn!("No request received within {:?}; closing connection", self.read_timeout);
                return Ok(());
            }
        };

        let reply = match read {
            Ok(Some(message)) => {
                debug!("Received {} message", message.kind());
                self.handle(message).await
            }
            Ok(None) => {
                debug!("Peer closed before sending a message");
                return Ok(());
            }
            Err(e) => {
                warn!("Rejecting message: {}", e);
                Message::error(format!("Invalid message: {}", e), None)
            }
        };

        let task_type = match &reply {
            Message::Response { task_type, .. } => Some(*task_type),
            _ => None,
        };

        match write_message(&mut stream, &reply).await {
            Err(ProtocolError::MessageTooLarge { size, max }) => {
                let fallback = Message::error(
                    format!("Result of {} bytes exceeds the {} byte limit", size, max),
                    task_type,
                );
                write_message(&mut stream, &fallback).await?;
            }
            other => other?,
        }

        stream.shutdown().await?;
        Ok(())
    }
}

/// Accept connections until `shutdown` resolves, then wait for in-flight
/// handlers to finish
pub async fn run_server<F>(dispatcher: Arc<Dispatcher>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr().context("Failed to read listener address")?;
    info!(
        "Dispatcher listening on {} ({} slots, {:?} workers)",
        local,
        dispatcher.pool().size(),
        dispatcher.pool().mode()
    );

    let mut handlers = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested; no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                debug!("New connection from {}", peer);
                let dispatcher = dispatcher.clone();
                handlers.spawn(async move {
                    if let Err(e) = dispatcher.serve_connection(stream).await {
                        warn!("Connection from {} ended with error: {}", peer, e);
                    }
                });
            }
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    if !handlers.is_empty() {
        info!("Waiting for {} in-flight connections", handlers.len());
    }
    let grace = dispatcher.shutdown_grace;
    let drained = timeout(grace, async { while handlers.join_next().await.is_some() {} }).await;
    if drained.is_err() {
        warn!(
            "Aborting {} connections still open after {:?}",
            handlers.len(),
            grace
        );
        handlers.shutdown().await;
    }

    dispatcher.pool().shutdown().await;
    Ok(())
}
