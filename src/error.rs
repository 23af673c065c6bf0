use crate::{util::RelPath, util::Sha256, Arch, PackageKind, Variant};

/// Failure taxonomy for the acquisition pipeline.
///
/// Every variant carries enough identity to report which package or payload
/// failed without the caller re-deriving it. Formatting here is diagnostic
/// only, the library itself never prints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The catalog has no package satisfying the request
    #[error("no {kind} package satisfies {arch}/{variant}: {detail}")]
    UnresolvedRequest {
        kind: PackageKind,
        arch: Arch,
        variant: Variant,
        detail: String,
    },

    /// Downloaded bytes do not hash to the catalog's declared digest
    #[error("payload '{payload}' hashed to {actual} but the catalog declares {expected}")]
    IntegrityMismatch {
        payload: String,
        expected: Sha256,
        actual: Sha256,
    },

    /// Network level failure that persisted beyond the retry budget
    #[error("payload '{payload}' still failing after {attempts} attempt(s)")]
    TransientFetchError {
        payload: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Server definitively rejected the request, retrying cannot help
    #[error("payload '{payload}' rejected with HTTP status {status}")]
    FatalFetchError { payload: String, status: u16 },

    /// Container structure is violated, the payload cannot be decoded
    #[error("archive '{payload}' is corrupt: {reason}")]
    CorruptArchive { payload: String, reason: String },

    /// Two packages claim the same destination and no precedence rule applies
    #[error("conflicting content for '{destination}': {first} vs {second}")]
    UnresolvedConflict {
        destination: RelPath,
        first: String,
        second: String,
    },

    /// Sibling task aborted after another task recorded the first failure.
    /// Never the primary error reported from a run.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
