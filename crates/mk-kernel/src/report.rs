//! Deterministic JSON reports.
//!
//! Reports are pretty-printed with sorted keys and a trailing newline so
//! the same input always produces the same bytes.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{KernelError, Result};

/// Render a report.
pub fn render_report<T: Serialize + ?Sized>(report: &T) -> std::result::Result<String, serde_json::Error> {
    // Round-trip through `Value` so struct fields come out key-sorted too.
    let value: Value = serde_json::to_value(report)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

/// Render and write a report, creating parent directories.
pub fn write_report<T: Serialize + ?Sized>(path: &Path, report: &T) -> Result<()> {
    let text = render_report(report).map_err(|e| {
        KernelError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| KernelError::io(parent, e))?;
    }
    std::fs::write(path, text).map_err(|e| KernelError::io(path, e))?;
    info!(path = %path.display(), "report written");
    Ok(())
}
