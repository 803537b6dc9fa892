//! Purpose: Shared error model for the client, transport, and CLI.
//! Exports: `Error`, `ErrorKind`, `ClientResult`, `to_exit_code`.
//! Role: Single error type carried through every layer; kinds drive recovery.
//! Invariants: Connection faults (`Protocol`, `Io`, `Auth`) are the only kinds that poison a connection.
//! Invariants: Exit code mapping is stable once published.
use std::error::Error as StdError;
use std::fmt;

pub type ClientResult<T> = Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Configuration,
    Offline,
    Protocol,
    Decode,
    Auth,
    Io,
    Shutdown,
}

impl ErrorKind {
    pub fn is_connection_fault(self) -> bool {
        matches!(self, ErrorKind::Protocol | ErrorKind::Io | ErrorKind::Auth)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    tag: Option<String>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            tag: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// True when the server rejected a digest invocation because it has
    /// never seen the script source.
    pub fn is_no_script(&self) -> bool {
        self.kind == ErrorKind::Protocol
            && self
                .message
                .as_deref()
                .is_some_and(|message| message.starts_with("NOSCRIPT"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, " (tag: {tag})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Configuration => 2,
        ErrorKind::Offline => 3,
        ErrorKind::Protocol => 4,
        ErrorKind::Decode => 5,
        ErrorKind::Auth => 6,
        ErrorKind::Io => 7,
        ErrorKind::Shutdown => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Configuration, 2),
            (ErrorKind::Offline, 3),
            (ErrorKind::Protocol, 4),
            (ErrorKind::Decode, 5),
            (ErrorKind::Auth, 6),
            (ErrorKind::Io, 7),
            (ErrorKind::Shutdown, 8),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_message_and_tag() {
        let err = Error::new(ErrorKind::Protocol)
            .with_message("ERR boom")
            .with_tag("score");
        assert_eq!(err.to_string(), "Protocol: ERR boom (tag: score)");
    }

    #[test]
    fn no_script_requires_protocol_kind_and_prefix() {
        let noscript = Error::new(ErrorKind::Protocol)
            .with_message("NOSCRIPT No matching script. Please use EVAL.");
        assert!(noscript.is_no_script());

        let other = Error::new(ErrorKind::Protocol).with_message("ERR unknown command");
        assert!(!other.is_no_script());

        let io = Error::new(ErrorKind::Io).with_message("NOSCRIPT");
        assert!(!io.is_no_script());
    }

    #[test]
    fn decode_is_not_a_connection_fault() {
        assert!(!ErrorKind::Decode.is_connection_fault());
        assert!(!ErrorKind::Offline.is_connection_fault());
        assert!(ErrorKind::Io.is_connection_fault());
        assert!(ErrorKind::Auth.is_connection_fault());
    }
}
