use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use crate::executor::{TaskExecutor, TaskInput};
use crate::protocol::{read_message, write_message, Message, ProtocolError};

/// Serve jobs from a parent dispatcher until it closes the input stream.
///
/// Each `Request` gets exactly one `Response` or `Error`. Stdout belongs to
/// the protocol, so nothing else may write to `writer`.
pub async fn run_worker<R, W>(
    executor: Arc<dyn TaskExecutor>,
    mut reader: R,
    mut writer: W,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Worker {} ready", std::process::id());

    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Dispatcher closed the worker pipe");
                return Ok(());
            }
            Err(ProtocolError::Io(e)) => return Err(ProtocolError::Io(e)),
            Err(e) => {
                // The stream position is unknown after a bad frame
                error!("Worker received an unreadable job: {}", e);
                write_message(&mut writer, &Message::error(format!("Invalid message: {}", e), None))
                    .await?;
                return Err(e);
            }
        };

        let reply = match message {
            Message::Request {
                task_type,
                url,
                params,
                ..
            } => {
                let input = TaskInput::new(url, params);
                match executor.execute(task_type, &input).await {
                    Ok(result) => Message::response(task_type, result, Map::new()),
                    Err(e) => {
                        error!("{} job for {} failed: {}", task_type, input.url, e);
                        Message::error(e.to_string(), Some(task_type))
                    }
                }
            }
            Message::Ping { .. } => {
                let mut details = Map::new();
                details.insert("pid".to_string(), Value::from(std::process::id()));
                Message::pong(details)
            }
            other => Message::error(format!("Unexpected {} message", other.kind()), None),
        };

        send(&mut writer, reply).await?;
    }
}

/// Write a reply, downgrading it to an error when it cannot be framed
async fn send<W>(writer: &mut W, reply: Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let task_type = match &reply {
        Message::Response { task_type, .. } => Some(*task_type),
        _ => None,
    };

    match write_message(writer, &reply).await {
        Err(ProtocolError::MessageTooLarge { size, max }) => {
            let fallback = Message::error(
                format!("Result of {} bytes exceeds the {} byte limit", size, max),
                task_type,
            );
            write_message(writer, &fallback).await
        }
        other => other,
    }
}
