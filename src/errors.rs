use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TraceError>;

/// Everything that can go wrong while driving a tracee.
///
/// `ThreadGone` is the benign case: the target task exited underneath us,
/// which is expected when racing a live process. All other variants are
/// surfaced to the user one way or another.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("thread is gone")]
    ThreadGone,

    #[error("syscall: {0:?}")]
    Syscall(Errno),

    #[error("libunwind: {0}")]
    Unwind(unwind::Error),

    #[error("deadly signal: {0:?}")]
    DeadlySignal(Signal),

    #[error("stacktrace requested from a terminated tracer")]
    AlreadyTerminated,

    #[error("heartbeat: too soon")]
    TooSoon,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<unwind::Error> for TraceError {
    fn from(err: unwind::Error) -> TraceError {
        TraceError::Unwind(err)
    }
}

impl TraceError {
    /// Classify a syscall failure against a task that may exit at any time:
    /// `ESRCH` means the task is gone, everything else is fatal.
    pub fn from_syscall(err: nix::Error) -> TraceError {
        match err {
            nix::Error::Sys(Errno::ESRCH) => TraceError::ThreadGone,
            nix::Error::Sys(errno) => TraceError::Syscall(errno),
            _other => TraceError::Syscall(Errno::UnknownErrno),
        }
    }

    /// Classify a syscall failure where the task racing us to exit is not a
    /// valid excuse.
    pub fn fatal(err: nix::Error) -> TraceError {
        match err {
            nix::Error::Sys(errno) => TraceError::Syscall(errno),
            _other => TraceError::Syscall(Errno::UnknownErrno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esrch_is_thread_gone() {
        let err = TraceError::from_syscall(nix::Error::Sys(Errno::ESRCH));
        assert!(matches!(err, TraceError::ThreadGone));
    }

    #[test]
    fn other_errnos_are_fatal() {
        let err = TraceError::from_syscall(nix::Error::Sys(Errno::EIO));
        assert!(matches!(err, TraceError::Syscall(Errno::EIO)));
        let err = TraceError::fatal(nix::Error::Sys(Errno::ESRCH));
        assert!(matches!(err, TraceError::Syscall(Errno::ESRCH)));
    }

    #[test]
    fn syscall_errors_name_the_errno() {
        let err = TraceError::Syscall(Errno::ESRCH);
        assert!(format!("{}", err).contains("ESRCH"));
    }
}
