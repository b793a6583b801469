//! HTML to PDF generation through a headless Chromium process.

use async_trait::async_trait;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::html::prepend_to_head;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("PDF engine unavailable: {0}")]
    Unavailable(io::Error),
    #[error("failed to stage document: {0}")]
    Io(io::Error),
    #[error("PDF engine failed (exit {exit_code:?}): {stderr}")]
    Engine {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("PDF engine timed out after {0:?}")]
    TimedOut(Duration),
    #[error("PDF engine produced no output at {0}")]
    MissingOutput(PathBuf),
    #[error("failed to prepare document: {0}")]
    Document(String),
}

/// Page size and print options for a generated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub print_background: bool,
}

impl Default for PageGeometry {
    /// Landscape A4 at 72 dpi.
    fn default() -> Self {
        Self {
            width_px: 842,
            height_px: 595,
            print_background: true,
        }
    }
}

impl PageGeometry {
    fn print_style(&self) -> String {
        let mut style = format!(
            "<style>@page {{ size: {}px {}px; margin: 0; }}",
            self.width_px, self.height_px
        );
        if self.print_background {
            style.push_str(
                " html { -webkit-print-color-adjust: exact; print-color-adjust: exact; }",
            );
        }
        style.push_str("</style>");
        style
    }
}

/// Writes a PDF rendering of an HTML document to a local path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(
        &self,
        html: &str,
        page: &PageGeometry,
        destination: &Path,
    ) -> Result<(), GenerationError>;
}

/// Drives `chromium --headless --print-to-pdf` against a staged HTML file.
pub struct ChromiumPdfGenerator {
    binary: PathBuf,
    timeout: Duration,
}

impl ChromiumPdfGenerator {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command_args(source: &url::Url, destination: &Path) -> Vec<String> {
        vec![
            "--headless".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--hide-scrollbars".to_string(),
            "--no-pdf-header-footer".to_string(),
            "--run-all-compositor-stages-before-draw".to_string(),
            format!("--print-to-pdf={}", destination.display()),
            source.to_string(),
        ]
    }

    fn stage_html(html: &str, dir: &Path) -> Result<tempfile::NamedTempFile, GenerationError> {
        let mut staged = tempfile::Builder::new()
            .prefix("certificate-")
            .suffix(".html")
            .tempfile_in(dir)
            .map_err(GenerationError::Io)?;
        staged
            .write_all(html.as_bytes())
            .map_err(GenerationError::Io)?;
        staged.flush().map_err(GenerationError::Io)?;
        Ok(staged)
    }
}

#[async_trait]
impl DocumentGenerator for ChromiumPdfGenerator {
    async fn generate(
        &self,
        html: &str,
        page: &PageGeometry,
        destination: &Path,
    ) -> Result<(), GenerationError> {
        let started_at = Instant::now();
        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(GenerationError::Io)?;

        let document = prepend_to_head(html, &page.print_style()).map_err(GenerationError::Document)?;
        let staged = Self::stage_html(&document, dir)?;
        let staged_path = std::path::absolute(staged.path()).map_err(GenerationError::Io)?;
        let source = url::Url::from_file_path(&staged_path).map_err(|()| {
            GenerationError::Document(format!("not a file path: {}", staged_path.display()))
        })?;
        let destination = std::path::absolute(destination).map_err(GenerationError::Io)?;

        let child = Command::new(&self.binary)
            .args(Self::command_args(&source, &destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(
                    binary = %self.binary.display(),
                    error = %err,
                    "Failed to spawn PDF engine"
                );
                if err.kind() == ErrorKind::NotFound {
                    GenerationError::Unavailable(err)
                } else {
                    GenerationError::Io(err)
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GenerationError::TimedOut(self.timeout))?
            .map_err(GenerationError::Io)?;

        if !output.status.success() {
            let exit_code = output.status.code();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                stderr = %stderr,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "PDF engine invocation failed"
            );
            return Err(GenerationError::Engine { exit_code, stderr });
        }

        let pdf_bytes = match tokio::fs::metadata(&destination).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => return Err(GenerationError::MissingOutput(destination)),
        };

        info!(
            output = %destination.display(),
            pdf_bytes,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "PDF generated"
        );
        Ok(())
    }
}
