use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop the monitor.
///
/// Setup failures, execution failures, unrecognized exits and signal
/// discipline violations are all fatal: callers propagate them up to
/// `main`, which reports and exits non-zero. Routine exits never become
/// a `VMError`.
#[derive(Debug, Error)]
pub enum VMError {
    #[error("cannot open /dev/kvm: {0}")]
    DeviceOpen(#[source] kvm_ioctls::Error),

    #[error("got KVM api version {got}, expected {expected}")]
    ApiVersion { got: i32, expected: i32 },

    #[error("{op} failed: {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("guest memory error: {0}")]
    Memory(String),

    #[error("image {path:?} is {size} bytes, only {capacity} bytes fit at the load address")]
    ImageTooLarge {
        path: PathBuf,
        size: usize,
        capacity: usize,
    },

    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),

    #[error("{vm}: KVM_RUN failed: {source}")]
    Execution {
        vm: String,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("{vm}: unrecognized exit reason {reason}")]
    UnrecognizedExit { vm: String, reason: String },

    #[error("signal discipline violated: {0}")]
    SignalDiscipline(String),

    #[error("preemption timer error: {0}")]
    Timer(#[source] std::io::Error),

    #[error("VM configuration error: {0}")]
    VMConfiguration(String),
}

impl From<vm_memory::GuestMemoryError> for VMError {
    fn from(err: vm_memory::GuestMemoryError) -> Self {
        VMError::Memory(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VMError>;
