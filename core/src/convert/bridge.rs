use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::convert::{Conversion, Converter, DirectConverter};
use crate::error::{Error, Result};

/// Two-stage converter for office formats: headless office suite to PDF,
/// then the direct engine on the PDF.
///
/// The office suite shares one per-user profile and misbehaves beyond a
/// couple of concurrent instances, so the first stage runs under a
/// process-wide semaphore. The permit is released as soon as the PDF
/// exists — the markdown stage of one task may overlap the office stage of
/// another.
pub struct BridgeConverter {
    direct: Arc<DirectConverter>,
    office: Arc<Semaphore>,
    timeout: Duration,
    binary: String,
}

impl BridgeConverter {
    pub fn new(direct: Arc<DirectConverter>, office: Arc<Semaphore>, timeout: Duration) -> Self {
        Self {
            direct,
            office,
            timeout,
            binary: "libreoffice".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn office_to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf> {
        let permit = self
            .office
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConverterFailed("office semaphore closed".to_string()))?;
        debug!(input = %input.display(), "office permit acquired");

        let result = self.run_office(input, out_dir).await;
        drop(permit);
        debug!(input = %input.display(), "office permit released");
        result
    }

    async fn run_office(&self, input: &Path, out_dir: &Path) -> Result<PathBuf> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(out_dir)
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::ConverterFailed(format!("failed to spawn {}: {e}", self.binary)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!(input = %input.display(), "office conversion timed out, killing");
                return Err(Error::ConverterTimeout(self.timeout.as_secs()));
            }
            Ok(output) => output?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Error::ConverterFailed(format!(
                "office conversion exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        // The suite grumbles about javaldx on every headless run.
        if !stderr.trim().is_empty() && !stderr.to_lowercase().contains("failed to launch javaldx")
        {
            warn!(stderr = %stderr.trim(), "office suite stderr output");
        }

        let stem = input
            .file_stem()
            .ok_or_else(|| Error::ConverterFailed("input has no file stem".to_string()))?;
        let pdf = out_dir.join(format!("{}.pdf", stem.to_string_lossy()));
        if !pdf.is_file() {
            return Err(Error::ConverterFailed(format!(
                "office suite did not produce {}",
                pdf.display()
            )));
        }
        Ok(pdf)
    }
}

#[async_trait]
impl Converter for BridgeConverter {
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<Conversion> {
        let scratch = tempfile::tempdir()?;
        let pdf = self.office_to_pdf(input, scratch.path()).await?;
        // Second stage runs without the office permit.
        self.direct.convert(&pdf, output_dir).await
    }
}
