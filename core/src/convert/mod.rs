//! Converter capabilities and the extension dispatch table.
//!
//! Two engines exist. The direct engine feeds a document straight to the
//! markdown extractor; the bridge engine first rasterizes office formats to
//! PDF through a headless office suite and then reuses the direct engine.
//! Both are constructed once and shared by every worker.

mod bridge;
mod direct;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::QueueOpts;
use crate::error::{Error, Result};

pub use bridge::BridgeConverter;
pub use direct::DirectConverter;

/// Formats the markdown engine understands natively.
pub const DIRECT_FORMATS: &[&str] = &["pdf", "epub", "pptx", "xlsx"];

/// Formats that must go through the office suite first.
pub const BRIDGE_FORMATS: &[&str] = &["doc", "docx", "odt", "rtf", "xls"];

/// Output of a successful conversion.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub markdown: PathBuf,
    /// Present only when the document contained images.
    pub images_dir: Option<PathBuf>,
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input` into markdown under `output_dir`.
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<Conversion>;
}

/// The process-wide converter set, dispatched on file extension.
#[derive(Clone)]
pub struct Converters {
    direct: Arc<dyn Converter>,
    bridge: Arc<dyn Converter>,
}

impl Converters {
    pub fn new(opts: &QueueOpts) -> Self {
        let timeout = opts.converter_timeout();
        let direct = Arc::new(DirectConverter::new(timeout));
        let office = Arc::new(Semaphore::new(opts.office_concurrency));
        let bridge = Arc::new(BridgeConverter::new(direct.clone(), office, timeout));
        Self { direct, bridge }
    }

    /// Swap in custom engines. Used by tests to observe dispatch without
    /// spawning real subprocesses.
    pub fn with_engines(direct: Arc<dyn Converter>, bridge: Arc<dyn Converter>) -> Self {
        Self { direct, bridge }
    }

    /// Pick the engine for a lower-case extension (without dot). Unknown
    /// extensions fail here, before any task work happens.
    pub fn for_extension(&self, extension: &str) -> Result<Arc<dyn Converter>> {
        if DIRECT_FORMATS.contains(&extension) {
            Ok(self.direct.clone())
        } else if BRIDGE_FORMATS.contains(&extension) {
            Ok(self.bridge.clone())
        } else {
            Err(Error::UnsupportedFormat(extension.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagConverter(&'static str);

    #[async_trait]
    impl Converter for TagConverter {
        async fn convert(&self, _input: &Path, output_dir: &Path) -> Result<Conversion> {
            Ok(Conversion {
                markdown: output_dir.join(self.0),
                images_dir: None,
            })
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_extension() {
        let converters = Converters::with_engines(
            Arc::new(TagConverter("direct.md")),
            Arc::new(TagConverter("bridge.md")),
        );

        for ext in DIRECT_FORMATS {
            let engine = converters.for_extension(ext).unwrap();
            let out = engine.convert(Path::new("in"), Path::new("/tmp")).await.unwrap();
            assert!(out.markdown.ends_with("direct.md"), "{ext} should go direct");
        }
        for ext in BRIDGE_FORMATS {
            let engine = converters.for_extension(ext).unwrap();
            let out = engine.convert(Path::new("in"), Path::new("/tmp")).await.unwrap();
            assert!(out.markdown.ends_with("bridge.md"), "{ext} should go through the bridge");
        }
    }

    #[test]
    fn unknown_extensions_are_rejected_at_dispatch() {
        let converters = Converters::with_engines(
            Arc::new(TagConverter("a")),
            Arc::new(TagConverter("b")),
        );
        for ext in ["exe", "html", "zip", ""] {
            assert!(matches!(
                converters.for_extension(ext),
                Err(Error::UnsupportedFormat(_))
            ));
        }
    }
}
