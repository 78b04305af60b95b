use std::io;
use std::sync::Mutex;

use thiserror::Error;

/// HIO error taxonomy. Every fallible operation in the library resolves to
/// one of these kinds; success is expressed as `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HioError {
    /// Unclassified failure
    #[error("generic failure")]
    Generic,

    /// Permission denied
    #[error("permission denied")]
    Perm,

    /// Short write or truncated data
    #[error("data truncated")]
    Truncate,

    /// Out of memory or file handles
    #[error("out of resource")]
    OutOfResource,

    /// Object or path not found
    #[error("not found")]
    NotFound,

    /// Feature or resource not available on this system
    #[error("not available")]
    NotAvailable,

    /// Invalid argument or malformed input
    #[error("bad parameter")]
    BadParam,

    /// Object already exists
    #[error("already exists")]
    Exists,

    /// Transient I/O failure, eligible for retry
    #[error("temporary i/o failure")]
    IoTemporary,

    /// Hard I/O failure; triggers data-root fallback at open time
    #[error("permanent i/o failure")]
    IoPermanent,
}

pub type HioResult<T> = Result<T, HioError>;

impl HioError {
    /// Stable integer code for this error kind. Success is 0, errors are
    /// negative so that a min-reduction across ranks picks the worst result.
    pub fn code(self) -> i64 {
        match self {
            HioError::Generic => -1,
            HioError::Perm => -2,
            HioError::Truncate => -3,
            HioError::OutOfResource => -4,
            HioError::NotFound => -5,
            HioError::NotAvailable => -6,
            HioError::BadParam => -7,
            HioError::Exists => -8,
            HioError::IoTemporary => -9,
            HioError::IoPermanent => -10,
        }
    }

    /// Inverse of [`HioError::code`]. Codes 0 and above map to `Ok(())`.
    pub fn from_code(code: i64) -> HioResult<()> {
        match code {
            c if c >= 0 => Ok(()),
            -2 => Err(HioError::Perm),
            -3 => Err(HioError::Truncate),
            -4 => Err(HioError::OutOfResource),
            -5 => Err(HioError::NotFound),
            -6 => Err(HioError::NotAvailable),
            -7 => Err(HioError::BadParam),
            -8 => Err(HioError::Exists),
            -9 => Err(HioError::IoTemporary),
            -10 => Err(HioError::IoPermanent),
            _ => Err(HioError::Generic),
        }
    }

    /// Translate a raw OS error number into the taxonomy.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM | libc::EACCES => HioError::Perm,
            libc::ENOMEM => HioError::OutOfResource,
            libc::ENOENT | libc::ENOTDIR => HioError::NotFound,
            libc::EIO => HioError::IoPermanent,
            libc::EEXIST => HioError::Exists,
            libc::EAGAIN | libc::EINTR => HioError::IoTemporary,
            _ => HioError::Generic,
        }
    }
}

impl From<io::Error> for HioError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => HioError::NotFound,
            io::ErrorKind::PermissionDenied => HioError::Perm,
            io::ErrorKind::AlreadyExists => HioError::Exists,
            io::ErrorKind::InvalidInput => HioError::BadParam,
            io::ErrorKind::OutOfMemory => HioError::OutOfResource,
            _ => {
                if let Some(errno) = e.raw_os_error() {
                    HioError::from_errno(errno)
                } else {
                    HioError::Generic
                }
            }
        }
    }
}

/// One entry on an error stack.
#[derive(Debug, Clone)]
pub struct ErrorStackEntry {
    pub error: HioError,
    pub message: String,
}

/// LIFO stack of error messages. Each context carries one; errors raised
/// with no context land on the process-wide stack.
#[derive(Debug, Default)]
pub struct ErrorStack {
    items: Mutex<Vec<ErrorStackEntry>>,
}

impl ErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: HioError, message: String) {
        log::error!("{message}: {error}");
        self.items.lock().unwrap().push(ErrorStackEntry { error, message });
    }

    /// Pop the most recent entry.
    pub fn pop(&self) -> Option<ErrorStackEntry> {
        self.items.lock().unwrap().pop()
    }

    /// Drain every accumulated entry, most recent first.
    pub fn drain(&self) -> Vec<ErrorStackEntry> {
        let mut items = self.items.lock().unwrap();
        let mut out: Vec<_> = items.drain(..).collect();
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static PROCESS_STACK: Mutex<Vec<ErrorStackEntry>> = Mutex::new(Vec::new());

/// Push an error with no associated context onto the process-wide stack.
pub fn push_process_error(error: HioError, message: String) {
    log::error!("{message}: {error}");
    PROCESS_STACK
        .lock()
        .unwrap()
        .push(ErrorStackEntry { error, message });
}

/// Pop the most recent process-wide error.
pub fn pop_process_error() -> Option<ErrorStackEntry> {
    PROCESS_STACK.lock().unwrap().pop()
}
