//! Crate-wide error taxonomy.
//!
//! Every fallible call in this crate returns a [`Result`]; there is no
//! non-local transfer of control. The variants mirror the error kinds
//! enumerated by the on-media/RPC contract rather than naming the exact
//! failure site, so that callers can match on *kind* the way the core's
//! `merr_t` classification does.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Location hint carried by device-level failures, analogous to the
/// `{rcode, offset, msg}` report the core returns for device operations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceErrorReport {
    pub rcode: RCode,
    /// Argument offset the core blames for the failure, if applicable.
    pub offset: i32,
    /// Human-readable message; only meaningful when `rcode == RCode::ErrMsg`.
    pub msg: String,
}

impl DeviceErrorReport {
    pub fn new(rcode: RCode, offset: i32, msg: impl Into<String>) -> Self {
        DeviceErrorReport { rcode, offset, msg: msg.into() }
    }
}

impl fmt::Display for DeviceErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rcode == RCode::ErrMsg {
            write!(f, "{} (at argument {})", self.msg, self.offset)
        } else {
            write!(f, "{} (at argument {})", self.rcode.as_str(), self.offset)
        }
    }
}

impl std::error::Error for DeviceErrorReport {}

/// Device error report codes, per the core's RPC contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RCode {
    None,
    ErrMsg,
    Open,
    Parm,
    Magic,
    Stat,
    Enomem,
    DevRw,
    NotActivated,
    DevActivated,
    MpNoDev,
    InvalDev,
    MpExist,
    EntNamInv,
}

impl RCode {
    fn as_str(&self) -> &'static str {
        match self {
            RCode::None => "no error",
            RCode::ErrMsg => "see message",
            RCode::Open => "device open failed",
            RCode::Parm => "invalid device parameter",
            RCode::Magic => "bad magic",
            RCode::Stat => "stat failed",
            RCode::Enomem => "out of memory",
            RCode::DevRw => "device read/write failed",
            RCode::NotActivated => "pool not activated",
            RCode::DevActivated => "device already activated",
            RCode::MpNoDev => "no such device in pool",
            RCode::InvalDev => "invalid device",
            RCode::MpExist => "pool already exists",
            RCode::EntNamInv => "invalid entity name",
        }
    }
}

/// The crate-wide error taxonomy.
///
/// Every kind below corresponds to a bucket in the error taxonomy: the
/// caller is expected to match on `Error` to decide whether a failure is
/// retryable (`Transient`, `Overflow`) or terminal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("transient failure (retryable): {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("invalid state: {0}")]
    State(String),

    /// Read buffer too small. `required` is the caller's retry size.
    #[error("buffer too small, {required} bytes required")]
    Overflow { required: usize },

    #[error("device error: {0}")]
    Device(#[from] DeviceErrorReport),

    /// Software bug: a structural invariant was violated. In debug builds
    /// callers are expected to let this propagate into a panic via
    /// `debug_assert!` rather than silently recovering.
    #[error("internal invariant violated: {0}")]
    Bug(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(e.to_string())
    }
}
