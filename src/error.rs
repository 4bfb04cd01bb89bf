//! Error type for the transport engine.

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

//------------ Error ---------------------------------------------------------

/// Error type for the transport engine.
///
/// Variants that are caused by an underlying I/O error carry that error
/// wrapped in an [`Arc`] so the type stays cheap to clone.
#[derive(Clone, Debug)]
pub enum Error {
    /// The query was cancelled by the caller.
    Cancelled,

    /// Connecting a stream socket gave an error.
    ConnectError(Arc<std::io::Error>),

    /// The channel the query was submitted to is no longer usable.
    ConnectionClosed,

    /// Starting the reactor thread or its runtime gave an error.
    Reactor(Arc<std::io::Error>),

    /// The request is too short to carry a transaction identifier.
    ShortMessage,

    /// The engine was shut down while the query was pending.
    Shutdown,

    /// Stream channel closed because it was idle for too long.
    StreamIdleTimeout,

    /// The request does not fit a 16-bit stream length prefix.
    StreamLongMessage,

    /// Reading from a stream socket gave an error.
    StreamReadError(Arc<std::io::Error>),

    /// The stream ended in the middle of a message.
    StreamUnexpectedEndOfData,

    /// Writing to a stream socket gave an error.
    StreamWriteError(Arc<std::io::Error>),

    /// No response arrived before the query deadline.
    Timeout,

    /// Too many queries are currently outstanding.
    TooManyQueries,

    /// Binding the datagram socket gave an error.
    UdpBind(Arc<std::io::Error>),

    /// Receiving from the datagram socket gave an error.
    UdpReceive(Arc<std::io::Error>),

    /// Sending over the datagram socket gave an error.
    UdpSend(Arc<std::io::Error>),

    /// Sending over the datagram socket gave a partial result.
    UdpShortSend,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Cancelled => write!(f, "query cancelled"),
            Error::ConnectError(_) => {
                write!(f, "error connecting stream socket")
            }
            Error::ConnectionClosed => write!(f, "channel closed"),
            Error::Reactor(_) => write!(f, "error starting reactor"),
            Error::ShortMessage => {
                write!(f, "request too short for a transaction id")
            }
            Error::Shutdown => write!(f, "engine shut down"),
            Error::StreamIdleTimeout => {
                write!(f, "stream was idle for too long")
            }
            Error::StreamLongMessage => {
                write!(f, "request too long for a stream message")
            }
            Error::StreamReadError(_) => {
                write!(f, "error reading from stream")
            }
            Error::StreamUnexpectedEndOfData => {
                write!(f, "unexpected end of data")
            }
            Error::StreamWriteError(_) => {
                write!(f, "error writing to stream")
            }
            Error::Timeout => write!(f, "timeout waiting for response"),
            Error::TooManyQueries => write!(f, "too many outstanding queries"),
            Error::UdpBind(_) => write!(f, "error binding UDP socket"),
            Error::UdpReceive(_) => {
                write!(f, "error receiving from UDP socket")
            }
            Error::UdpSend(_) => write!(f, "error sending to UDP socket"),
            Error::UdpShortSend => write!(f, "partial send to UDP socket"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ConnectError(e) => Some(e),
            Error::Reactor(e) => Some(e),
            Error::StreamReadError(e) => Some(e),
            Error::StreamWriteError(e) => Some(e),
            Error::UdpBind(e) => Some(e),
            Error::UdpReceive(e) => Some(e),
            Error::UdpSend(e) => Some(e),
            _ => None,
        }
    }
}
