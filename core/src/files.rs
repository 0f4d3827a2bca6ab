//! Filename hygiene and content hashing.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Every extension the service accepts at the upload boundary. `zip` is
/// special: archives are unwrapped before enqueue and never reach a
/// converter themselves.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "doc", "docx", "epub", "odt", "pdf", "pptx", "rtf", "xls", "xlsx", "zip",
];

const MAX_STEM_LEN: usize = 100;

/// Lower-case extension without the dot, or empty when there is none.
pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn is_format_supported(filename: &str) -> bool {
    SUPPORTED_FORMATS.contains(&file_extension(filename).as_str())
}

/// Reduce an untrusted filename to something safe to join onto a local
/// directory: directory components stripped, stem restricted to
/// `[A-Za-z0-9._-]` (everything else becomes `_`) and capped at 100
/// characters, extension preserved. An empty stem becomes `document`.
pub fn sanitize_filename(filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, ext) = match name.rfind('.') {
        Some(pos) => (&name[..pos], &name[pos..]),
        None => (name.as_str(), ""),
    };

    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };

    let mut stem = clean(stem);
    if stem.is_empty() {
        stem = "document".to_string();
    }
    if stem.len() > MAX_STEM_LEN {
        stem.truncate(MAX_STEM_LEN);
    }

    format!("{stem}{}", clean(ext))
}

/// Streaming SHA-256 of a file, hex-encoded. Runs on the calling thread;
/// use [`sha256_file`] from async contexts.
pub fn sha256_file_blocking(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file_blocking(&path))
        .await
        .map_err(|e| std::io::Error::other(e))?
}
