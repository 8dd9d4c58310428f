//! Error types for the jailbox runtime.

use rustix::io::Errno;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the runtime layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Schema or type violation in config.json / process.json.
    #[error("malformed config: {0}")]
    MalformedConfig(String),

    /// config.json declares an ociVersion outside 1.0.x / 1.1.x.
    #[error("unsupported OCI version {0}")]
    UnsupportedOciVersion(String),

    /// `create` against an id that already has a state directory.
    #[error("container {0} exists")]
    ContainerExists(String),

    /// A command referenced an absent container.
    #[error("container {0} not found")]
    ContainerNotFound(String),

    /// The container is not in a state the command accepts.
    #[error("container {id} is in state \"{status}\", expected {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: &'static str,
    },

    /// A syscall failed; `context` names the operation and its operand.
    #[error("{context}: {errno}")]
    Syscall { context: String, errno: Errno },

    /// A jail parameter syscall failed, with the kernel errmsg when set.
    #[error("{op}: {source}")]
    Jail {
        op: &'static str,
        source: jailbox_sys::jail::JailError,
    },

    /// `/sbin/devfs rule apply` exited nonzero.
    #[error("devfs exited with status {0}")]
    DevfsFailed(i32),

    /// A hook exited nonzero (or was killed), aborting its phase.
    #[error("hook {path} exited with status {status}")]
    HookFailed { path: String, status: i32 },

    /// `validate()` could not resolve the container command.
    #[error("executable {0} not found in container")]
    ExecutableNotFound(String),

    /// Signal argument that is neither a number nor a known name.
    #[error("unknown signal name {0}")]
    UnknownSignal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn syscall(context: impl Into<String>, errno: Errno) -> Self {
        Self::Syscall {
            context: context.into(),
            errno,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedConfig(message.into())
    }
}

/// nix reports errno through its own type; the runtime standardizes on
/// rustix's.
pub(crate) fn nix_errno(errno: nix::errno::Errno) -> Errno {
    Errno::from_raw_os_error(errno as i32)
}

pub(crate) fn io_errno(e: &std::io::Error) -> Errno {
    Errno::from_raw_os_error(e.raw_os_error().unwrap_or(0))
}
