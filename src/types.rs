//! Reply values, the error taxonomy and the error-callback vocabulary.

use std::error;
use std::fmt;
use std::io;

/// A single parsed reply from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A nil reply (missing key, empty range).
    Nil,
    /// An integer reply.
    Int(i64),
    /// A bulk string, kept as raw bytes.
    Data(Vec<u8>),
    /// An array of replies.
    Bulk(Vec<Value>),
    /// A status reply other than `OK`.
    Status(String),
    /// The `+OK` status reply.
    Okay,
}

impl Value {
    /// Returns the status string if this is a status reply.
    pub fn as_status(&self) -> Option<&str> {
        match self {
            Value::Okay => Some("OK"),
            Value::Status(s) => Some(s),
            _ => None,
        }
    }
}

/// Classification of a router failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller violated an input precondition (empty key, empty argv).
    InvalidArgument,
    /// A transport to a node could not be opened or attached.
    ConnectionFailed,
    /// An in-flight submission failed because the transport is gone.
    Disconnected,
    /// A reply could not be parsed, or the probe reply had an unexpected shape.
    CriticalFailure,
    /// The server reported that the cluster is not serving requests.
    ClusterDown,
    /// The `ASKING` handshake could not be submitted or was not acknowledged.
    AskingFailed,
    /// The follow-up submission after a MOVED redirect could not be sent.
    MovedFailed,
    /// An internal invariant was violated.
    LogicError,
    /// The server signalled a permanent slot relocation.
    Moved,
    /// The server signalled an in-progress slot migration.
    Ask,
    /// The server asked for the command to be retried later.
    TryAgain,
    /// Any other error reply; surfaced to the caller unchanged.
    ResponseError,
    /// An underlying IO error.
    IoError,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Io(io::Error),
}

/// Represents a router error.
pub struct RouterError {
    repr: ErrorRepr,
}

/// Library generic result type.
pub type RouterResult<T> = Result<T, RouterError>;

impl PartialEq for RouterError {
    fn eq(&self, other: &RouterError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, desc_a), &ErrorRepr::WithDescription(kind_b, desc_b)) => {
                kind_a == kind_b && desc_a == desc_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, desc_a, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, desc_b, _),
            ) => kind_a == kind_b && desc_a == desc_b,
            _ => false,
        }
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> RouterError {
        RouterError {
            repr: ErrorRepr::Io(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RouterError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RouterError {
        RouterError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RouterError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RouterError {
        RouterError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for RouterError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::Io(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl RouterError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _) | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Io(_) => ErrorKind::IoError,
        }
    }

    /// Returns the error detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// For a MOVED or ASK reply, returns the redirect target and the slot
    /// named by the server.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        match self.kind() {
            ErrorKind::Moved | ErrorKind::Ask => (),
            _ => return None,
        }
        let mut iter = self.detail()?.split_whitespace();
        let slot = iter.next()?.parse::<u16>().ok()?;
        let addr = iter.next()?;
        Some((addr, slot))
    }

    /// True when the underlying transport is known to be unusable.
    pub fn is_connection_dropped(&self) -> bool {
        matches!(self.kind(), ErrorKind::Disconnected | ErrorKind::IoError)
    }
}

/// Builds the error for an `-ERR`-style reply line, classifying redirection
/// and cluster-state replies by their leading token.
pub(crate) fn make_reply_error(msg: &str) -> RouterError {
    let code = msg.split(' ').next().unwrap_or("");
    let kind = match code {
        "MOVED" => ErrorKind::Moved,
        "ASK" => ErrorKind::Ask,
        "TRYAGAIN" => ErrorKind::TryAgain,
        "CLUSTERDOWN" => ErrorKind::ClusterDown,
        _ => ErrorKind::ResponseError,
    };
    let detail = match kind {
        // Keep only the arguments so that `redirect_node` can parse them.
        ErrorKind::Moved | ErrorKind::Ask => msg[code.len()..].trim_start().to_string(),
        _ => msg.to_string(),
    };
    RouterError::from((kind, "An error was signalled by the server", detail))
}

/// Where a command was in its lifecycle when an error surfaced, as handed to
/// the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The reply was received; the error is domain-level.
    Ready,
    /// During the `ASKING` handshake of an ASK redirect.
    Ask,
    /// While following a MOVED redirect.
    Moved,
    /// The command failed outside a redirect excursion.
    Failed,
}

/// Verdict returned by an error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-submit the original request on the connection used last.
    Retry,
    /// Surface the current result to the reply callback and terminate.
    Finish,
}
