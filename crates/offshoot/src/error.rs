//! Error types for spawn and capture operations.

use nix::errno::Errno;

/// Error types for process operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The executable could not be resolved to a runnable path.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// Executing the program or applying the requested credentials was
    /// denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A file-descriptor, process, or memory limit was reached.
    #[error("resource limit reached: {}", Errno::from_raw(*.0).desc())]
    ResourceExhausted(i32),

    /// The child failed between fork and exec; carries the raw OS error
    /// reported through the spawn error pipe.
    #[error("spawn failed: {}", Errno::from_raw(*.0).desc())]
    SpawnFailed(i32),

    /// The spawn request combines mutually exclusive options or contains
    /// malformed argv/envp data.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An I/O failure while feeding or draining the child's pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an OS error reported by the child before exec.
    ///
    /// `context` is the program (or credential target) the error refers to,
    /// used for the not-found and permission kinds which name their subject.
    pub(crate) fn from_child_errno(errno: i32, context: &str) -> Self {
        match Errno::from_raw(errno) {
            Errno::ENOENT => Self::ExecutableNotFound(context.to_string()),
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied(context.to_string()),
            Errno::EMFILE | Errno::ENFILE | Errno::EAGAIN | Errno::ENOMEM => {
                Self::ResourceExhausted(errno)
            },
            _ => Self::SpawnFailed(errno),
        }
    }
}
