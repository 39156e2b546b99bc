//! Chromium discovery and launch.
//!
//! The caller owns the profile directory: it must exist before launch and
//! is removed by the session's browser handle once the browser goes away.

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

// Markers of containerized environments, where Chrome's setuid sandbox
// cannot work and must be disabled.
const CONTAINER_FS_MARKERS: &[&str] = &["/.dockerenv", "/run/.containerenv"];
const CONTAINER_ENV_MARKERS: &[&str] = &["container", "KUBERNETES_SERVICE_HOST"];

// Chrome emits CDP events chromiumoxide has no schema for; the resulting
// deserialization failures carry no signal and must not pollute the error
// log (they fire on almost every page load).
const BENIGN_CDP_NOISE: &[&str] = &[
    "data did not match any variant of untagged enum Message",
    "Failed to deserialize WS response",
];

fn sandbox_unsupported() -> bool {
    CONTAINER_FS_MARKERS
        .iter()
        .any(|marker| Path::new(marker).exists())
        || CONTAINER_ENV_MARKERS
            .iter()
            .any(|var| std::env::var_os(var).is_some())
}

/// Whether a CDP handler error is known protocol noise rather than a real
/// failure
pub(crate) fn is_benign_cdp_noise(message: &str) -> bool {
    BENIGN_CDP_NOISE
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Find a Chrome/Chromium executable with platform-specific search paths.
///
/// `CHROMIUM_PATH` overrides all other discovery methods.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!(
                "Using browser from CHROMIUM_PATH environment variable: {}",
                path.display()
            );
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH environment variable points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = if let Some(stripped) = path_str.strip_prefix("~/") {
            match dirs::home_dir() {
                Some(home) => home.join(stripped),
                None => continue,
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    // Fall back to `which` on Unix systems
    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            let output = Command::new("which").arg(cmd).output();
            if let Ok(output) = output
                && output.status.success()
            {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    let path = PathBuf::from(path_str);
                    info!("Found browser using 'which' command: {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Launch a browser against an existing profile directory.
///
/// `profile_dir` must already exist; its lifecycle (including removal after
/// the browser stops) belongs to the caller. Returns the browser and the
/// CDP handler task, which the caller must abort on teardown.
pub async fn launch_browser(
    headless: bool,
    profile_dir: &Path,
    disable_security: bool,
) -> Result<(Browser, JoinHandle<()>)> {
    let chrome_path = find_browser_executable().await?;

    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1280, 720)
        .user_data_dir(profile_dir)
        .chrome_executable(chrome_path);

    if headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    config_builder = config_builder
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-hang-monitor")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--mute-audio");

    if disable_security {
        info!("WARNING: Disabling browser security features (disable_security=true)");
        config_builder = config_builder
            .arg("--disable-web-security")
            .arg("--ignore-certificate-errors");
    }

    if sandbox_unsupported() || disable_security {
        info!("Disabling Chrome sandbox");
        config_builder = config_builder
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox");
    }

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = task::spawn(async move {
        while let Some(event) = handler.next().await {
            let Err(e) = event else { continue };
            let message = e.to_string();
            if is_benign_cdp_noise(&message) {
                trace!("Dropping benign CDP noise: {message}");
            } else {
                error!("CDP handler error: {message}");
            }
        }
        debug!("CDP handler loop finished");
    });

    Ok((browser, handler_task))
}
