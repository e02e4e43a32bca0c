//! Error taxonomy and native failure classification
//!
//! Every failed operation surfaces as an [`OpError`] carrying exactly one
//! [`ErrorKind`] out of a closed set of nineteen. Native failures (errno
//! values, `std::io::Error`, rustls errors) are mapped through a fixed lookup
//! table; anything the table does not know lands on [`ErrorKind::FALLBACK`].

use std::fmt;
use std::io;
use std::str::FromStr;

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    AddrInUse,
    AddrNotAvailable,
    BrokenPipe,
    AlreadyExists,
    InvalidData,
    TimedOut,
    Interrupted,
    WriteZero,
    UnexpectedEof,
    BadResource,
    Http,
    Busy,
    NotSupported,
}

impl ErrorKind {
    /// Every member of the taxonomy, in declaration order
    pub const ALL: [ErrorKind; 19] = [
        ErrorKind::NotFound,
        ErrorKind::PermissionDenied,
        ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset,
        ErrorKind::ConnectionAborted,
        ErrorKind::NotConnected,
        ErrorKind::AddrInUse,
        ErrorKind::AddrNotAvailable,
        ErrorKind::BrokenPipe,
        ErrorKind::AlreadyExists,
        ErrorKind::InvalidData,
        ErrorKind::TimedOut,
        ErrorKind::Interrupted,
        ErrorKind::WriteZero,
        ErrorKind::UnexpectedEof,
        ErrorKind::BadResource,
        ErrorKind::Http,
        ErrorKind::Busy,
        ErrorKind::NotSupported,
    ];

    /// Kind used for native codes absent from the lookup table
    pub const FALLBACK: ErrorKind = ErrorKind::NotSupported;

    /// Name of the kind as it appears in formatted errors
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::ConnectionRefused => "ConnectionRefused",
            ErrorKind::ConnectionReset => "ConnectionReset",
            ErrorKind::ConnectionAborted => "ConnectionAborted",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::AddrInUse => "AddrInUse",
            ErrorKind::AddrNotAvailable => "AddrNotAvailable",
            ErrorKind::BrokenPipe => "BrokenPipe",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::TimedOut => "TimedOut",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::WriteZero => "WriteZero",
            ErrorKind::UnexpectedEof => "UnexpectedEof",
            ErrorKind::BadResource => "BadResource",
            ErrorKind::Http => "Http",
            ErrorKind::Busy => "Busy",
            ErrorKind::NotSupported => "NotSupported",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrorKind {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| OpError::new(ErrorKind::InvalidData, format!("unknown error kind '{}'", s)))
    }
}

/// A classified operation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    kind: ErrorKind,
    message: String,
}

/// Result type for dispatched operations
pub type OpResult<T> = Result<T, OpError>;

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Handle is unknown, closed, or of the wrong kind for the operation
    pub fn bad_resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadResource, message)
    }

    /// Operation settled early because its resource or cancel handle closed
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupted, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    /// Build an error from a raw platform error code
    pub fn from_errno(code: i32) -> Self {
        Self::new(
            classify_errno(code),
            io::Error::from_raw_os_error(code).to_string(),
        )
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OpError {}

// =============================================================================
// Classification
// =============================================================================

/// Platform error code to kind. First match wins, so aliases such as
/// `EWOULDBLOCK == EAGAIN` are harmless.
static ERRNO_TABLE: &[(i32, ErrorKind)] = &[
    (libc::ENOENT, ErrorKind::NotFound),
    (libc::ESRCH, ErrorKind::NotFound),
    (libc::EACCES, ErrorKind::PermissionDenied),
    (libc::EPERM, ErrorKind::PermissionDenied),
    (libc::ECONNREFUSED, ErrorKind::ConnectionRefused),
    (libc::ECONNRESET, ErrorKind::ConnectionReset),
    (libc::ECONNABORTED, ErrorKind::ConnectionAborted),
    (libc::ENOTCONN, ErrorKind::NotConnected),
    (libc::EADDRINUSE, ErrorKind::AddrInUse),
    (libc::EADDRNOTAVAIL, ErrorKind::AddrNotAvailable),
    (libc::EPIPE, ErrorKind::BrokenPipe),
    (libc::ESHUTDOWN, ErrorKind::BrokenPipe),
    (libc::EEXIST, ErrorKind::AlreadyExists),
    (libc::EINVAL, ErrorKind::InvalidData),
    (libc::EILSEQ, ErrorKind::InvalidData),
    (libc::ETIMEDOUT, ErrorKind::TimedOut),
    (libc::EINTR, ErrorKind::Interrupted),
    (libc::EBADF, ErrorKind::BadResource),
    (libc::ENOTSOCK, ErrorKind::BadResource),
    (libc::EBUSY, ErrorKind::Busy),
    (libc::ETXTBSY, ErrorKind::Busy),
    (libc::EAGAIN, ErrorKind::Busy),
    (libc::EWOULDBLOCK, ErrorKind::Busy),
    (libc::ENOTSUP, ErrorKind::NotSupported),
    (libc::EOPNOTSUPP, ErrorKind::NotSupported),
    (libc::ENOSYS, ErrorKind::NotSupported),
];

/// Map a raw platform error code to its kind
pub fn classify_errno(code: i32) -> ErrorKind {
    ERRNO_TABLE
        .iter()
        .find(|(errno, _)| *errno == code)
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::FALLBACK)
}

/// Map a std I/O error kind (used when no OS code is attached)
pub fn classify_io_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
        io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
        io::ErrorKind::NotConnected => ErrorKind::NotConnected,
        io::ErrorKind::AddrInUse => ErrorKind::AddrInUse,
        io::ErrorKind::AddrNotAvailable => ErrorKind::AddrNotAvailable,
        io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => ErrorKind::InvalidData,
        io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        io::ErrorKind::WriteZero => ErrorKind::WriteZero,
        io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::Unsupported => ErrorKind::NotSupported,
        _ => ErrorKind::FALLBACK,
    }
}

/// Classify a std I/O error, preferring its OS code when present
pub fn classify(err: &io::Error) -> ErrorKind {
    match err.raw_os_error() {
        Some(code) => classify_errno(code),
        None => classify_io_kind(err.kind()),
    }
}

impl From<io::Error> for OpError {
    fn from(err: io::Error) -> Self {
        // rustls surfaces its own failures through io::Error when driven via
        // read_tls/write_tls helpers
        if let Some(inner) = err.get_ref() {
            if inner.downcast_ref::<rustls::Error>().is_some() {
                return OpError::invalid_data(err.to_string());
            }
        }
        OpError::new(classify(&err), err.to_string())
    }
}

impl From<nix::errno::Errno> for OpError {
    fn from(errno: nix::errno::Errno) -> Self {
        OpError::new(classify_errno(errno as i32), errno.desc())
    }
}

impl From<rustls::Error> for OpError {
    fn from(err: rustls::Error) -> Self {
        OpError::invalid_data(format!("TLS error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let err = OpError::bad_resource("handle 7 is not open");
        assert_eq!(err.to_string(), "BadResource: handle 7 is not open");
    }

    #[test]
    fn test_taxonomy_is_closed() {
        assert_eq!(ErrorKind::ALL.len(), 19);
        let mut names: Vec<_> = ErrorKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 19);
    }

    #[test]
    fn test_name_roundtrip() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.name().parse::<ErrorKind>().unwrap(), kind);
        }
        let err = "Teapot".parse::<ErrorKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_errno_table() {
        assert_eq!(classify_errno(libc::ENOENT), ErrorKind::NotFound);
        assert_eq!(classify_errno(libc::EACCES), ErrorKind::PermissionDenied);
        assert_eq!(classify_errno(libc::ECONNREFUSED), ErrorKind::ConnectionRefused);
        assert_eq!(classify_errno(libc::EADDRINUSE), ErrorKind::AddrInUse);
        assert_eq!(classify_errno(libc::EPIPE), ErrorKind::BrokenPipe);
        assert_eq!(classify_errno(libc::EBADF), ErrorKind::BadResource);
        assert_eq!(classify_errno(libc::EBUSY), ErrorKind::Busy);
        assert_eq!(classify_errno(libc::EINTR), ErrorKind::Interrupted);
    }

    #[test]
    fn test_classification_is_deterministic() {
        for &(code, _) in ERRNO_TABLE {
            let first = classify_errno(code);
            for _ in 0..100 {
                assert_eq!(classify_errno(code), first);
            }
        }
    }

    #[test]
    fn test_unmapped_code_falls_back() {
        assert_eq!(classify_errno(libc::ENOSPC), ErrorKind::FALLBACK);
        assert_eq!(classify_errno(-12345), ErrorKind::FALLBACK);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: OpError = io::Error::from_raw_os_error(libc::ECONNRESET).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        let err: OpError = io::Error::new(io::ErrorKind::WriteZero, "nothing written").into();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
        assert_eq!(err.to_string(), "WriteZero: nothing written");

        let err: OpError = io::Error::new(io::ErrorKind::Other, "odd").into();
        assert_eq!(err.kind(), ErrorKind::FALLBACK);
    }

    #[test]
    fn test_nix_errno_conversion() {
        let err: OpError = nix::errno::Errno::ENOTCONN.into();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
