use part::{PartError, PartName};

/// Part store failures that callers react to individually.
///
/// Store methods return `anyhow::Result`; these travel inside the
/// `anyhow::Error` and are recovered with [`StoreError::find`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("rows are not sorted by the sort key")]
    UnsortedInput,
    #[error("part {0} not found")]
    PartNotFound(PartName),
    #[error("checksum mismatch for part {part}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        part: String,
        expected: u32,
        actual: u32,
    },
}

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

impl StoreError {
    /// Finds a `StoreError` anywhere in an error chain.
    #[must_use]
    pub fn find(err: &anyhow::Error) -> Option<&StoreError> {
        err.chain().find_map(|e| e.downcast_ref::<StoreError>())
    }

    #[must_use]
    pub fn is_resource_exhausted(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(StoreError::ResourceExhausted(_)))
    }

    #[must_use]
    pub fn is_checksum_mismatch(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(StoreError::ChecksumMismatch { .. }))
    }
}

/// Rewrites lower-level failures into their [`StoreError`] form: a full disk
/// becomes `ResourceExhausted`, a part checksum failure `ChecksumMismatch`.
pub(crate) fn classify(err: anyhow::Error) -> anyhow::Error {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(ENOSPC) {
                return StoreError::ResourceExhausted(format!("no space left on device: {}", io)).into();
            }
        }
        if let Some(PartError::ChecksumMismatch {
            part,
            expected,
            actual,
        }) = cause.downcast_ref::<PartError>()
        {
            return StoreError::ChecksumMismatch {
                part: part.clone(),
                expected: *expected,
                actual: *actual,
            }
            .into();
        }
    }
    err
}
