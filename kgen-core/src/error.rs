//! Error types for the provenance core

use thiserror::Error;

/// Errors surfaced across the public boundary of the core.
///
/// Verification paths report diagnostics inside their reports instead of
/// returning these; construction and signing paths return them directly.
#[derive(Error, Debug)]
pub enum KgenError {
    #[error("config error: {0}")]
    Config(String),

    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("dependency cycle: {path}")]
    DependencyCycle { path: String },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("build timed out after {0} ms")]
    Timeout(u64),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("artifact unreadable: {path}: {reason}")]
    ArtifactUnreadable { path: String, reason: String },
}

pub type KgenResult<T> = Result<T, KgenError>;

impl KgenError {
    /// Exit code for the CLI surface. Verification validity is handled by
    /// the caller; this only maps error kinds.
    pub fn exit_code(&self) -> i32 {
        match self {
            KgenError::DependencyCycle { .. } => 2,
            KgenError::Io(_)
            | KgenError::ArtifactMissing(_)
            | KgenError::ArtifactUnreadable { .. } => 3,
            KgenError::Crypto(_) | KgenError::Config(_) => 4,
            KgenError::BuildFailed(_) | KgenError::Timeout(_) => 5,
            _ => 1,
        }
    }
}
