use anyhow::{Context, Result};
use serde_json::Map;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cli::config::{AppConfig, WorkerMode};
use crate::dispatcher::{self, Dispatcher, WorkerCommand, WorkerPool};
use crate::executor::PageAnalyzer;
use crate::gateway::{self, AppState, DispatcherClient, PageFetcher};
use crate::protocol::{Message, TaskType};

/// Resolves on Ctrl-C; never resolves when the handler cannot be installed
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Run the HTTP gateway until Ctrl-C
pub async fn run_gateway(config_path: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let bind = bind.unwrap_or_else(|| config.gateway.bind.clone());

    let store = if config.gateway.enable_cache || config.gateway.enable_rate_limit {
        gateway::connect_store(&config.store).await
    } else {
        None
    };

    let state = Arc::new(AppState::new(&config, store)?);
    let listener = TcpListener::bind(&bind)
        .await
        .context(format!("Failed to bind gateway to {}", bind))?;

    info!("Full scrapes go to the dispatcher at {}", config.gateway.processing_addr);
    gateway::serve(state, listener, shutdown_signal()).await
}

/// Run the task dispatcher until Ctrl-C
pub async fn run_dispatcher(
    config_path: Option<PathBuf>,
    bind: Option<String>,
    workers: Option<usize>,
) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let bind = bind.unwrap_or_else(|| config.dispatcher.bind.clone());
    let pool_size = workers
        .filter(|n| *n > 0)
        .unwrap_or_else(|| config.dispatcher.effective_pool_size());

    let pool = match config.dispatcher.worker_mode {
        WorkerMode::Process => {
            let command = WorkerCommand::current_exe(config_path.as_deref())
                .context("Failed to locate the pagegate executable")?;
            WorkerPool::processes(pool_size, command)?
        }
        WorkerMode::InProcess => {
            WorkerPool::in_process(pool_size, Arc::new(PageAnalyzer::new(config.executors.clone())))
        }
    };

    let server = Arc::new(
        Dispatcher::new(Arc::new(pool), config.dispatcher.task_timeout())
            .with_read_timeout(config.dispatcher.read_timeout())
            .with_shutdown_grace(config.dispatcher.shutdown_grace()),
    );
    let listener = TcpListener::bind(&bind)
        .await
        .context(format!("Failed to bind dispatcher to {}", bind))?;

    dispatcher::run_server(server, listener, shutdown_signal()).await
}

/// Serve pool jobs over stdin/stdout until the dispatcher hangs up
pub async fn run_worker(config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let executor = Arc::new(PageAnalyzer::new(config.executors));

    dispatcher::run_worker(executor, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Worker stopped on a protocol error")
}

/// Send one request to a dispatcher and print the reply
pub async fn submit(
    config_path: Option<PathBuf>,
    task: TaskType,
    url: String,
    addr: Option<String>,
    fetch: bool,
) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;

    let mut settings = config.gateway.clone();
    if let Some(addr) = addr {
        settings.processing_addr = addr;
    }

    let params = if fetch {
        let page = PageFetcher::new(&settings)?.fetch(&url).await?;
        info!("Fetched {} ({} bytes)", url, page.html.len());
        gateway::page_params(&page.html, &page.headers)
    } else {
        Map::new()
    };

    let client = DispatcherClient::new(&settings);
    let reply = client
        .send(&Message::request(task, url, params))
        .await
        .context(format!("No reply from dispatcher at {}", client.addr()))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&reply).context("Failed to render the reply")?
    );

    if let Message::Error { error_message, .. } = reply {
        anyhow::bail!("Dispatcher returned an error: {}", error_message);
    }

    Ok(())
}

/// Show the effective configuration
pub async fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let path = config_path.unwrap_or_else(AppConfig::default_path);

    println!("Configuration ({}):", path.display());
    println!(
        "{}",
        serde_yaml::to_string(&config).context("Failed to serialize configuration")?
    );

    Ok(())
}

/// Write the default configuration unless a file is already there
pub async fn init_config(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(AppConfig::default_path);

    if path.exists() {
        warn!("Configuration already exists at {}; leaving it untouched", path.display());
        println!("Configuration already exists: {}", path.display());
        return Ok(());
    }

    AppConfig::default().save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_config_writes_once() {
        let dir = std::env::temp_dir().join(format!("pagegate-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.yaml");

        init_config(Some(path.clone())).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("max_requests: 10"));

        std::fs::write(&path, "cache:\n  ttl_secs: 5\n").unwrap();
        init_config(Some(path.clone())).await.unwrap();
        assert_eq!(AppConfig::load(Some(&path)).unwrap().cache.ttl_secs, 5);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_submit_reports_unreachable_dispatcher() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dir = std::env::temp_dir().join(format!("pagegate-submit-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.yaml");
        AppConfig::default().save_to_file(&path).unwrap();

        let result = submit(Some(path), TaskType::Seo, "https://example.com".to_string(), Some(addr), false).await;
        assert!(result.is_err());

        std::fs::remove_dir_all(dir).ok();
    }
}
