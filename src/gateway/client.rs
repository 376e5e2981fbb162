use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::error::GatewayError;
use crate::cli::config::GatewaySettings;
use crate::protocol::{read_message, write_message, Message, ProtocolError, TaskType};

/// Request parameters carrying a fetched page to the executors
pub fn page_params(html: &str, headers: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("html".to_string(), Value::from(html));
    params.insert(
        "headers".to_string(),
        Value::Object(
            headers
                .iter()
                .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
                .collect(),
        ),
    );
    params
}

/// Client side of the dispatcher protocol: one request per connection
#[derive(Debug, Clone)]
pub struct DispatcherClient {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl DispatcherClient {
    pub fn new(settings: &GatewaySettings) -> Self {
        Self {
            addr: settings.processing_addr.clone(),
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one message and wait for the single reply
    pub async fn send(&self, message: &Message) -> Result<Message, GatewayError> {
        let down =
            |e: String| GatewayError::Processing(format!("dispatcher at {} unreachable: {}", self.addr, e));

        debug!("Connecting to dispatcher at {}", self.addr);
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| down(format!("no connection after {:?}", self.connect_timeout)))?
            .map_err(|e| down(e.to_string()))?;

        let exchange = async {
            write_message(&mut stream, message).await?;
            let reply = read_message(&mut stream).await?;
            stream.shutdown().await.ok();
            Ok::<_, ProtocolError>(reply)
        };

        match timeout(self.request_timeout, exchange).await {
            Err(_) => Err(GatewayError::Processing(format!(
                "dispatcher did not answer within {}s",
                self.request_timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(GatewayError::Processing(format!("dispatcher exchange failed: {}", e))),
            Ok(Ok(None)) => Err(GatewayError::Processing(
                "dispatcher closed the connection without replying".to_string(),
            )),
            Ok(Ok(Some(reply))) => Ok(reply),
        }
    }

    /// Run every analysis on an already fetched page.
    ///
    /// A dispatcher `Error` reply comes back as `GatewayError::Processing`
    /// carrying its message verbatim.
    pub async fn process_all(
        &self,
        url: &str,
        html: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Value, GatewayError> {
        let params = page_params(html, headers);
        info!("Requesting full analysis of {} ({} bytes of HTML)", url, html.len());

        match self.send(&Message::request(TaskType::All, url, params)).await? {
            Message::Response { result, .. } => Ok(result),
            Message::Error { error_message, .. } => {
                error!("Dispatcher failed to process {}: {}", url, error_message);
                Err(GatewayError::Processing(error_message))
            }
            other => Err(GatewayError::Processing(format!(
                "unexpected {} reply from dispatcher",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn fake_dispatcher(reply: Message) -> (String, tokio::task::JoinHandle<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_message(&mut socket).await.unwrap().unwrap();
            write_message(&mut socket, &reply).await.unwrap();
            request
        });

        (addr, handle)
    }

    fn client(addr: String) -> DispatcherClient {
        DispatcherClient::new(&GatewaySettings {
            processing_addr: addr,
            ..GatewaySettings::default()
        })
    }

    #[tokio::test]
    async fn test_process_all_sends_page_and_returns_result() {
        let (addr, server) =
            fake_dispatcher(Message::response(TaskType::All, json!({"seo": {"score": 80}}), Map::new())).await;

        let headers = BTreeMap::from([("server".to_string(), "nginx".to_string())]);
        let result = client(addr)
            .process_all("https://example.com", "<html></html>", &headers)
            .await
            .unwrap();
        assert_eq!(result["seo"]["score"], 80);

        match server.await.unwrap() {
            Message::Request { task_type, url, params, .. } => {
                assert_eq!(task_type, TaskType::All);
                assert_eq!(url, "https://example.com");
                assert_eq!(params["html"], "<html></html>");
                assert_eq!(params["headers"]["server"], "nginx");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_error_is_propagated_verbatim() {
        let (addr, _server) = fake_dispatcher(Message::error(
            "screenshot timed out after 60s",
            Some(TaskType::All),
        ))
        .await;

        let err = client(addr)
            .process_all("https://example.com", "<html></html>", &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "processing failed: screenshot timed out after 60s");
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher() {
        // Bind then drop so the port is known to be closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client(addr).send(&Message::ping()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Processing(ref m) if m.contains("unreachable")));
    }
}
