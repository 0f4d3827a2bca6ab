//! Result packaging: one ZIP per task, holding the markdown document and,
//! when the conversion produced any, its images.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};

/// Build `output` from the markdown file (stored as `document.md`) and the
/// optional images directory (stored under its own name, nested files
/// included). Synchronous; use [`create_result_zip`] from async contexts.
pub fn create_result_zip_blocking(
    markdown: &Path,
    images_dir: Option<&Path>,
    output: &Path,
) -> Result<PathBuf> {
    let file = File::create(output)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("document.md", options)
        .map_err(|e| Error::PackagingFailed(e.to_string()))?;
    io::copy(&mut File::open(markdown)?, &mut zip)?;

    if let Some(images_dir) = images_dir {
        if images_dir.is_dir() {
            let prefix = images_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "images".to_string());
            add_dir_recursive(&mut zip, images_dir, &prefix, options)?;
        }
    }

    zip.finish()
        .map_err(|e| Error::PackagingFailed(e.to_string()))?;
    info!(output = %output.display(), "created result archive");
    Ok(output.to_path_buf())
}

pub async fn create_result_zip(
    markdown: PathBuf,
    images_dir: Option<PathBuf>,
    output: PathBuf,
) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || {
        create_result_zip_blocking(&markdown, images_dir.as_deref(), &output)
    })
    .await
    .map_err(|e| Error::PackagingFailed(e.to_string()))?
}

fn add_dir_recursive(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let arcname = format!("{prefix}/{name}");
        if path.is_dir() {
            add_dir_recursive(zip, &path, &arcname, options)?;
        } else {
            zip.start_file(arcname.as_str(), options)
                .map_err(|e| Error::PackagingFailed(e.to_string()))?;
            io::copy(&mut File::open(&path)?, zip)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn archive_holds_markdown_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("out.md");
        std::fs::write(&md, "# converted\n").unwrap();

        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        std::fs::write(images.join("fig1.png"), [0u8; 16]).unwrap();

        let out = dir.path().join("result.zip");
        create_result_zip_blocking(&md, Some(&images), &out).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["document.md", "images/fig1.png"]);

        let mut content = String::new();
        archive
            .by_name("document.md")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "# converted\n");
    }

    #[test]
    fn markdown_only_when_no_images() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("out.md");
        std::fs::write(&md, "text").unwrap();

        let out = dir.path().join("result.zip");
        create_result_zip_blocking(&md, None, &out).unwrap();

        let archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn missing_markdown_is_a_packaging_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result.zip");
        let result = create_result_zip_blocking(&dir.path().join("absent.md"), None, &out);
        assert!(result.is_err());
    }
}
