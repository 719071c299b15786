use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// An error surfaced by a memcached command or by the connection itself.
///
/// Failures fall into two families. Command-scoped errors
/// ([`Error::InvalidArgument`], [`Error::NoSuchCommand`], [`Error::Client`],
/// [`Error::Server`]) fail a single command and leave the connection usable.
/// Connection-scoped errors ([`Error::Timeout`], [`Error::ConnectionDone`],
/// [`Error::Parse`]) are terminal: every outstanding command fails and the
/// transport is closed. Commands submitted after that point fail with
/// [`Error::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A command argument was rejected before anything was written to the
    /// transport, e.g. an over-long key.
    InvalidArgument(String),
    /// The server answered `ERROR` to a command it does not know.
    NoSuchCommand,
    /// The server sent `CLIENT_ERROR` with the given message.
    Client(String),
    /// The server sent `SERVER_ERROR` (text protocol) or a non-zero status
    /// frame (binary protocol) with the given message.
    Server(String),
    /// No response unit arrived within the configured idle timeout.
    Timeout,
    /// The connection closed while this command was still in flight. Carries
    /// the cause, e.g. the message of the parse error that tore the
    /// connection down.
    ConnectionDone(String),
    /// The command was submitted after the connection had already closed.
    Disconnected,
    /// The server violated the protocol. Returned by `receive`; the commands
    /// that were pending at that moment observe [`Error::ConnectionDone`]
    /// carrying the same message.
    Parse(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::InvalidArgument(msg) => write!(f, "{}", msg),
            Error::NoSuchCommand => write!(f, "No such command"),
            Error::Client(msg) => write!(f, "{}", msg),
            Error::Server(msg) => write!(f, "{}", msg),
            Error::Timeout => write!(f, "Connection timeout"),
            Error::ConnectionDone(reason) => write!(f, "{}", reason),
            Error::Disconnected => write!(f, "Not connected"),
            Error::Parse(msg) => write!(f, "{}", msg),
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn test_display() {
        assert_eq!("Connection timeout", format!("{}", Error::Timeout));
        assert_eq!("Not connected", format!("{}", Error::Disconnected));
        assert_eq!("No such command", format!("{}", Error::NoSuchCommand));
        assert_eq!(
            "We don't like egg and spam",
            format!("{}", Error::Client("We don't like egg and spam".into()))
        );
        assert_eq!(
            "Wrong magic byte: 0x82",
            format!("{}", Error::Parse("Wrong magic byte: 0x82".into()))
        );
    }
}
