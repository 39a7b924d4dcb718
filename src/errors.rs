//! Error types you might see while creating or driving a sandbox.

use thiserror::Error;

/// Coarse classification shared across the runtime's error types.
/// Control-plane errors cross the RPC boundary as strings, so the kinds
/// are a property of the local error, not the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    ResourceBusy,
    ResourceExhausted,
    NotImplemented,
    IoError,
    Interrupted,
    Canceled,
    SandboxGone,
    FilesystemError,
    ProtocolError,
}

/// Errors while creating or operating a sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// system call failed
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// control socket protocol error
    #[error("control socket protocol error: {0}")]
    Protocol(#[from] sandkern_protocol::buffer::Error),

    /// control client error
    #[error("{0}")]
    Control(#[from] sandkern_protocol::client::ClientError),

    /// no usable location for the control socket
    #[error("unable to find location to write socket file")]
    NoControlSocketLocation,

    /// the sandbox process could not be created
    #[error("cannot create sandbox process: {0}")]
    CreateSandboxProcess(String),

    /// the sandbox never signaled its boot sync pipe
    #[error("waiting for sandbox to start: {0}")]
    WaitForStart(String),

    /// the sandbox is no longer running
    #[error("sandbox no longer running and its exit status is unavailable")]
    SandboxGone,

    /// waiting for the sandbox process to stop timed out
    #[error("sandbox is still running after {0:?}")]
    StopTimeout(std::time::Duration),

    /// serialization of the persisted sandbox descriptor failed
    #[error("sandbox state encoding error: {0}")]
    StateEncoding(#[from] serde_json::Error),

    /// cgroup inspection failed
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// configuration rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// missing privileges for the requested sandbox setup
    #[error("{0}")]
    Privileges(String),

    /// binary permission check produced a diagnostic
    #[error("{0}")]
    BinaryPermissions(String),

    /// the seccomp policy could not be built or installed
    #[error("seccomp error: {0}")]
    Seccomp(#[from] crate::seccomp::SeccompError),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
                _ => ErrorKind::IoError,
            },
            SandboxError::Sys(errno) => match errno {
                nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => {
                    ErrorKind::PermissionDenied
                }
                nix::errno::Errno::ENOENT | nix::errno::Errno::ESRCH => ErrorKind::NotFound,
                nix::errno::Errno::EBUSY => ErrorKind::ResourceBusy,
                nix::errno::Errno::ENOMEM | nix::errno::Errno::ENOSPC => {
                    ErrorKind::ResourceExhausted
                }
                nix::errno::Errno::EINTR => ErrorKind::Interrupted,
                _ => ErrorKind::IoError,
            },
            SandboxError::Protocol(_) | SandboxError::Control(_) => ErrorKind::ProtocolError,
            SandboxError::NoControlSocketLocation => ErrorKind::ResourceExhausted,
            SandboxError::CreateSandboxProcess(_) => ErrorKind::IoError,
            SandboxError::WaitForStart(_) => ErrorKind::SandboxGone,
            SandboxError::SandboxGone => ErrorKind::SandboxGone,
            SandboxError::StopTimeout(_) => ErrorKind::ResourceBusy,
            SandboxError::StateEncoding(_) => ErrorKind::ProtocolError,
            SandboxError::Cgroup(_) => ErrorKind::FilesystemError,
            SandboxError::Config(_) => ErrorKind::InvalidArgument,
            SandboxError::Privileges(_) => ErrorKind::PermissionDenied,
            SandboxError::BinaryPermissions(_) => ErrorKind::PermissionDenied,
            SandboxError::Seccomp(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify() {
        let err = SandboxError::Sys(nix::errno::Errno::EACCES);
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let err = SandboxError::SandboxGone;
        assert_eq!(err.kind(), ErrorKind::SandboxGone);
        let err = SandboxError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
