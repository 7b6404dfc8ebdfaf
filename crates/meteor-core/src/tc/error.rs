//! Errors raised by the TC Programmer.

use crate::netlink;

/// Result type for TC operations.
pub type Result<T> = std::result::Result<T, TcError>;

/// Errors surfaced by [`super::program::TcProgrammer`] and [`super::link`].
#[derive(Debug, thiserror::Error)]
pub enum TcError {
    /// The kernel rejected a netlink request.
    #[error("kernel error during {operation}: {message} (errno {errno})")]
    Kernel {
        operation: String,
        errno: i32,
        message: String,
    },

    /// A lower-level netlink/socket failure (I/O, malformed response, ...).
    #[error("netlink error: {0}")]
    Netlink(#[from] netlink::Error),

    /// An interface name could not be resolved to an ifindex.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
}

impl TcError {
    /// Wrap a netlink kernel error with an operation label.
    pub fn kernel(operation: impl Into<String>, err: netlink::Error) -> Self {
        match err {
            netlink::Error::Kernel { errno, message }
            | netlink::Error::KernelWithContext { errno, message, .. } => Self::Kernel {
                operation: operation.into(),
                errno,
                message,
            },
            other => Self::Netlink(other),
        }
    }

    /// `true` for ENOENT/ENODEV, used by [`super::program`] delete paths
    /// that must tolerate "already gone".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if matches!(*errno, 2 | 19))
    }

    /// `true` for EEXIST, used by idempotent create paths.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if *errno == 17)
    }
}
