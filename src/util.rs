//! Small helpers shared across the harness.

use std::net::TcpListener;
use std::path::Path;

use tracing::debug;

use crate::errors::{HarnessError, Result};

/// Ask the OS for a currently free localhost port.
///
/// The probe socket is released before returning, so the caller should
/// hand the port to its consumer promptly.
///
/// # Errors
///
/// Returns [`HarnessError::Io`] when no socket can be bound.
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Download `url` into `dest`.
///
/// When `dest` already exists and `overwrite` is false, nothing is
/// fetched and the existing file is kept.
///
/// # Errors
///
/// Returns [`HarnessError::Download`] for HTTP failures (including
/// non-success status codes) and [`HarnessError::Io`] when the
/// destination cannot be written.
pub async fn download_file(url: &str, dest: &Path, overwrite: bool) -> Result<()> {
    if dest.exists() && !overwrite {
        debug!(url, dest = %dest.display(), "destination exists, skipping download");
        return Ok(());
    }
    let response = reqwest::get(url)
        .await
        .map_err(|err| HarnessError::Download(format!("GET {url} failed: {err}")))?
        .error_for_status()
        .map_err(|err| HarnessError::Download(format!("GET {url} failed: {err}")))?;
    let body = response
        .bytes()
        .await
        .map_err(|err| HarnessError::Download(format!("reading body of {url} failed: {err}")))?;
    tokio::fs::write(dest, &body).await?;
    debug!(url, dest = %dest.display(), bytes = body.len(), "download complete");
    Ok(())
}
