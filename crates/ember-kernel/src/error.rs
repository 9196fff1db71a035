use thiserror::Error;

/// Error numbers surfaced through stream operations and system calls.
/// Syscalls return them negated in `a0`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    #[error("invalid argument")]
    Inval = 1,
    #[error("device or resource busy")]
    Busy = 2,
    #[error("operation not supported")]
    NotSup = 3,
    #[error("no such device")]
    NoDev = 4,
    #[error("i/o error")]
    Io = 5,
    #[error("bad format")]
    BadFmt = 6,
    #[error("no such file or directory")]
    NoEnt = 7,
    #[error("bad file descriptor")]
    BadFd = 8,
    #[error("too many open files")]
    MFile = 9,
}

impl Errno {
    /// The negative code written into a syscall's return register.
    pub fn code(self) -> i64 {
        -(self as i64)
    }
}

pub type KResult<T> = Result<T, Errno>;

/// Initialization-time failures reported by `Kernel::boot`.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("initialization error: {0}")]
    Init(String),

    #[error("boot image error: {0}")]
    BootImage(Errno),
}
