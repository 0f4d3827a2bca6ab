use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Optional upload of a finished artifact to remote storage.
///
/// `Ok(None)` means the publisher declined (disabled, bucket missing) and
/// is not an error; the local `result_path` stays authoritative either way.
/// Implementations live outside the core — the queue only depends on this
/// contract.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(
        &self,
        artifact: &Path,
        original_filename: &str,
        task_id: Uuid,
    ) -> Result<Option<String>>;
}
