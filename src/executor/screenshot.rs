use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, info, warn};

use super::TaskError;
use crate::cli::config::ExecutorSettings;
use crate::protocol::TaskType;

/// PNG capture of the rendered page
#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    /// Base64-encoded PNG
    pub screenshot: String,
    pub screenshot_size: usize,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub final_url: String,
    pub timestamp: String,
}

fn failed(context: &str, e: WebDriverError) -> TaskError {
    TaskError::execution(TaskType::Screenshot, format!("{}: {}", context, e))
}

fn capabilities(settings: &ExecutorSettings) -> WebDriverResult<thirtyfour::ChromeCapabilities> {
    let mut caps = DesiredCapabilities::chrome();

    caps.add_chrome_arg(&format!(
        "--window-size={},{}",
        settings.viewport_width, settings.viewport_height
    ))?;
    if settings.headless {
        caps.set_headless()?;
    }
    caps.add_chrome_arg("--no-sandbox")?;
    caps.add_chrome_arg("--disable-dev-shm-usage")?;
    caps.add_chrome_arg("--disable-gpu")?;

    Ok(caps)
}

/// Render `url` in a WebDriver session and capture the viewport.
///
/// Fails when no driver answers at `webdriver_url`; the session is always
/// closed before returning.
pub async fn capture(settings: &ExecutorSettings, url: &str) -> Result<Screenshot, TaskError> {
    let caps = capabilities(settings).map_err(|e| failed("invalid browser capabilities", e))?;

    let driver = WebDriver::new(&settings.webdriver_url, caps)
        .await
        .map_err(|e| failed(&format!("cannot reach WebDriver at {}", settings.webdriver_url), e))?;

    let shot = grab(&driver, settings, url).await;

    if let Err(e) = driver.quit().await {
        warn!("Failed to close WebDriver session: {}", e);
    }

    let shot = shot.map_err(|e| failed(&format!("capture of {} failed", url), e))?;
    info!("Captured {} ({} bytes)", url, shot.screenshot_size);

    Ok(shot)
}

async fn grab(driver: &WebDriver, settings: &ExecutorSettings, url: &str) -> WebDriverResult<Screenshot> {
    driver
        .set_page_load_timeout(Duration::from_secs(settings.page_load_timeout_secs.max(1)))
        .await?;

    debug!("Navigating to: {}", url);
    driver.goto(url).await?;

    let png = driver.screenshot_as_png().await?;
    let title = driver.title().await?;
    let final_url = driver.current_url().await?.to_string();

    Ok(Screenshot {
        screenshot_size: png.len(),
        screenshot: STANDARD.encode(&png),
        format: "png".to_string(),
        width: settings.viewport_width,
        height: settings.viewport_height,
        title,
        final_url,
        timestamp: Utc::now().to_rfc3339(),
    })
}
