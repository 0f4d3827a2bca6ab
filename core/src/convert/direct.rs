use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::convert::{Conversion, Converter};
use crate::error::{Error, Result};

/// Stderr noise the extractor emits on perfectly fine conversions, mostly
/// from its XML and epub parsers. Lines matching none of these are logged
/// as warnings; they still never fail a zero-exit run.
const SAFE_STDERR_MARKERS: &[&str] = &[
    "UserWarning",
    "FutureWarning",
    "xml declaration",
    "XMLParsedAsHTMLWarning",
    "epub",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

/// Runs the markdown extraction engine as a child process, one invocation
/// per document, with a hard wall-clock timeout.
pub struct DirectConverter {
    binary: String,
    timeout: Duration,
}

impl DirectConverter {
    pub fn new(timeout: Duration) -> Self {
        Self::with_binary("marker_single", timeout)
    }

    pub fn with_binary(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run_engine(&self, input: &Path, scratch: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(input)
            .arg("--output_dir")
            .arg(scratch)
            .arg("--output_format")
            .arg("markdown")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary, input = %input.display(), "starting conversion engine");

        let child = cmd
            .spawn()
            .map_err(|e| Error::ConverterFailed(format!("failed to spawn {}: {e}", self.binary)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            // Dropping the in-flight future kills the child (kill_on_drop).
            Err(_) => {
                warn!(input = %input.display(), "conversion engine timed out, killing");
                return Err(Error::ConverterTimeout(self.timeout.as_secs()));
            }
            Ok(output) => output?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Error::ConverterFailed(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            if SAFE_STDERR_MARKERS.iter().any(|m| line.contains(m)) {
                debug!(%line, "engine warning (known-safe)");
            } else {
                warn!(%line, "engine warning");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Converter for DirectConverter {
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<Conversion> {
        let scratch = tempfile::tempdir()?;
        self.run_engine(input, scratch.path()).await?;

        let input = input.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let scratch_path = scratch.path().to_path_buf();
        let conversion = tokio::task::spawn_blocking(move || {
            collect_results(&input, &scratch_path, &output_dir)
        })
        .await
        .map_err(|e| Error::ConverterFailed(e.to_string()))??;

        drop(scratch);
        Ok(conversion)
    }
}

/// Gather the engine's scratch output into `output_dir`: markdown goes to
/// `document.md`, images into `images/`, and image references inside the
/// markdown are rewritten to the `./images/` layout.
fn collect_results(input: &Path, scratch: &Path, output_dir: &Path) -> Result<Conversion> {
    std::fs::create_dir_all(output_dir)?;

    let md_path = find_markdown(input, scratch).ok_or_else(|| {
        Error::ConverterFailed("engine did not produce markdown output".to_string())
    })?;
    let mut text = std::fs::read_to_string(&md_path)?;

    let images = find_images(scratch);
    let images_dir = output_dir.join("images");
    if !images.is_empty() {
        std::fs::create_dir_all(&images_dir)?;
    }
    for image in &images {
        let name = image.file_name().unwrap_or_default().to_string_lossy();
        std::fs::copy(image, images_dir.join(name.as_ref()))?;

        let target = format!("./images/{name}");
        if let Ok(rel) = image.strip_prefix(scratch) {
            let rel = rel.to_string_lossy();
            if rel != name {
                text = text.replace(rel.as_ref(), &target);
            }
        }
        if !text.contains(&target) {
            text = text.replace(name.as_ref(), &target);
        }
    }

    let markdown = output_dir.join("document.md");
    std::fs::write(&markdown, &text)?;

    info!(
        chars = text.len(),
        images = images.len(),
        "conversion output collected"
    );

    Ok(Conversion {
        markdown,
        images_dir: if images.is_empty() {
            None
        } else {
            Some(images_dir)
        },
    })
}

/// The engine usually writes `<stem>.md` or `<stem>/<stem>.md`; fall back
/// to the first markdown file anywhere in the scratch tree.
fn find_markdown(input: &Path, scratch: &Path) -> Option<PathBuf> {
    let stem = input.file_stem()?.to_string_lossy();

    let direct = scratch.join(format!("{stem}.md"));
    if direct.is_file() {
        return Some(direct);
    }
    let nested = scratch.join(stem.as_ref()).join(format!("{stem}.md"));
    if nested.is_file() {
        return Some(nested);
    }
    walk_files(scratch)
        .into_iter()
        .find(|p| p.extension().is_some_and(|e| e == "md"))
}

fn find_images(scratch: &Path) -> Vec<PathBuf> {
    walk_files(scratch)
        .into_iter()
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
        })
        .collect()
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_prefers_the_stem_named_markdown() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("report.md"), "# direct").unwrap();
        std::fs::write(scratch.path().join("other.md"), "# other").unwrap();

        let found = find_markdown(Path::new("/in/report.pdf"), scratch.path()).unwrap();
        assert_eq!(found, scratch.path().join("report.md"));
    }

    #[test]
    fn collect_falls_back_to_nested_output() {
        let scratch = tempfile::tempdir().unwrap();
        let nested = scratch.path().join("report");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("report.md"), "# nested").unwrap();

        let found = find_markdown(Path::new("report.pdf"), scratch.path()).unwrap();
        assert_eq!(found, nested.join("report.md"));
    }

    #[test]
    fn images_are_copied_and_links_rewritten() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(
            scratch.path().join("doc.md"),
            "see ![fig](fig_0.png) for details",
        )
        .unwrap();
        std::fs::write(scratch.path().join("fig_0.png"), [1u8; 8]).unwrap();

        let conversion =
            collect_results(Path::new("doc.pdf"), scratch.path(), out.path()).unwrap();

        assert_eq!(conversion.markdown, out.path().join("document.md"));
        let text = std::fs::read_to_string(&conversion.markdown).unwrap();
        assert!(text.contains("./images/fig_0.png"));
        assert!(conversion.images_dir.as_ref().unwrap().join("fig_0.png").is_file());
    }

    #[test]
    fn no_markdown_is_a_converter_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let result = collect_results(Path::new("doc.pdf"), scratch.path(), out.path());
        assert!(matches!(result, Err(Error::ConverterFailed(_))));
    }
}
