// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Status values and error scoping.
//!
//! Every fallible operation in this crate reports its outcome as a
//! [Status] value; nothing is thrown or panicked.  A status combines
//! a [Severity] with a [Code] and an optional OS-level errno, so that
//! both successful multi-step outcomes (partial progress, retry
//! requests from the transport) and the full range of stream faults
//! travel through the same channels.
use std::fmt::Display;
use std::fmt::Formatter;

/// How far an error reaches, and whether it can be retried.
///
/// This is used by the fault-handling paths to decide between
/// reconnection and giving up.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ErrorScope {
    /// The operation can be retried, possibly after reconnecting.
    Retryable,
    /// The operation failed for good, but the process is healthy.
    Unrecoverable,
    /// Something is wrong below us; retrying cannot help.
    Fatal
}

/// Trait for errors that can report their [ErrorScope].
pub trait ScopedError {
    /// Get the scope of this error.
    fn scope(&self) -> ErrorScope;
}

/// Severity of a [Status].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// The operation succeeded, possibly partially.
    Ok,
    /// The operation failed.
    Error,
    /// The operation failed in a way that must not be retried.
    Fatal
}

/// Detailed code of a [Status].
///
/// The first three are success codes, qualifying a [Severity::Ok]
/// status; the rest are error kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Code {
    /// The operation ran to completion.
    Done,
    /// The operation made partial progress and should be resumed
    /// when the socket is ready again.
    Continue,
    /// The caller should invoke the operation again immediately.
    Retry,
    /// The stream is in its error window and rejects new work.
    StreamError,
    /// The poller refused a registration or notification change.
    PollerError,
    /// A socket option could not be read or set.
    SocketOptError,
    /// The connection could not be established.
    ConnectionError,
    /// A read or write on the socket failed.
    SocketError,
    /// A queued message expired before it could be sent.
    SocketTimeout,
    /// The stream was disconnected with work outstanding.
    StreamDisconnect,
    /// An internal invariant was violated.
    FatalInternal
}

/// Outcome of an operation.
///
/// A plain `Status::done()` means full success.  Statuses compare by
/// value, so scripted tests can assert on exact outcomes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Status {
    severity: Severity,
    code: Code,
    errno: Option<i32>
}

impl Status {
    /// Full success.
    #[inline]
    pub const fn done() -> Self {
        Status {
            severity: Severity::Ok,
            code: Code::Done,
            errno: None
        }
    }

    /// Partial progress; resume when the socket is ready.
    #[inline]
    pub const fn in_progress() -> Self {
        Status {
            severity: Severity::Ok,
            code: Code::Continue,
            errno: None
        }
    }

    /// Success, but the caller should call again immediately.
    #[inline]
    pub const fn retry() -> Self {
        Status {
            severity: Severity::Ok,
            code: Code::Retry,
            errno: None
        }
    }

    /// An error with the given code.
    #[inline]
    pub const fn error(code: Code) -> Self {
        Status {
            severity: Severity::Error,
            code: code,
            errno: None
        }
    }

    /// An error with the given code and OS errno.
    #[inline]
    pub const fn error_errno(
        code: Code,
        errno: i32
    ) -> Self {
        Status {
            severity: Severity::Error,
            code: code,
            errno: Some(errno)
        }
    }

    /// A fatal error with the given code.
    #[inline]
    pub const fn fatal(code: Code) -> Self {
        Status {
            severity: Severity::Fatal,
            code: code,
            errno: None
        }
    }

    /// Get the severity.
    #[inline]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Get the detailed code.
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the OS errno, if one was recorded.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// Check whether the severity is [Severity::Ok].
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    /// Check whether the severity is [Severity::Fatal].
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl Default for Status {
    #[inline]
    fn default() -> Self {
        Status::done()
    }
}

impl ScopedError for Status {
    fn scope(&self) -> ErrorScope {
        match self.severity {
            Severity::Ok => ErrorScope::Retryable,
            Severity::Fatal => ErrorScope::Fatal,
            Severity::Error => match self.code {
                Code::ConnectionError |
                Code::SocketError |
                Code::SocketTimeout => ErrorScope::Retryable,
                _ => ErrorScope::Unrecoverable
            }
        }
    }
}

impl Display for Code {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), std::fmt::Error> {
        match self {
            Code::Done => write!(f, "done"),
            Code::Continue => write!(f, "in progress"),
            Code::Retry => write!(f, "retry requested"),
            Code::StreamError => write!(f, "stream in error state"),
            Code::PollerError => write!(f, "poller error"),
            Code::SocketOptError => write!(f, "socket option error"),
            Code::ConnectionError => write!(f, "connection error"),
            Code::SocketError => write!(f, "socket error"),
            Code::SocketTimeout => write!(f, "socket timeout"),
            Code::StreamDisconnect => write!(f, "stream disconnected"),
            Code::FatalInternal => write!(f, "internal error")
        }
    }
}

impl Display for Status {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), std::fmt::Error> {
        match self.errno {
            Some(errno) => write!(f, "{} (errno {})", self.code, errno),
            None => self.code.fmt(f)
        }
    }
}

#[test]
fn test_status_default_is_done() {
    let status = Status::default();

    assert!(status.is_ok());
    assert_eq!(status.code(), Code::Done);
    assert_eq!(status.errno(), None);
}

#[test]
fn test_status_scopes() {
    assert_eq!(Status::done().scope(), ErrorScope::Retryable);
    assert_eq!(
        Status::error(Code::SocketError).scope(),
        ErrorScope::Retryable
    );
    assert_eq!(
        Status::error(Code::StreamDisconnect).scope(),
        ErrorScope::Unrecoverable
    );
    assert_eq!(Status::fatal(Code::PollerError).scope(), ErrorScope::Fatal);
}

#[test]
fn test_status_display_errno() {
    let status = Status::error_errno(Code::SocketError, 32);

    assert_eq!(format!("{}", status), "socket error (errno 32)");
}
