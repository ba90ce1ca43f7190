use std::fmt;
use std::net::SocketAddr;

/// Main error type for the member transport
#[derive(Debug)]
pub enum MemberError {
    /// Listening socket could not be created on the configured address
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Stream-level framing inconsistency
    Frame(String),

    /// Payload failed codec interpretation
    Decode(DecodeError),

    /// Message could not be encoded into a payload
    Encode(bincode::error::EncodeError),

    /// Socket and outbound send errors
    Io(std::io::Error),

    /// Shutdown signal received mid-operation
    Interrupted(String),

    /// Configuration or CLI argument errors
    Config(String),

    /// Operation invoked in the wrong lifecycle state
    Lifecycle(String),

    /// Internal lock poisoning or thread errors
    Concurrency(String),

    /// One or more resources failed to release during shutdown
    Shutdown(Vec<MemberError>),
}

/// Codec specific errors
#[derive(Debug)]
pub enum DecodeError {
    /// Gossip payload could not be decoded
    Gossip(bincode::error::DecodeError),

    /// Envelope payload could not be decoded
    Envelope(bincode::error::DecodeError),

    /// Payload decoded but was not well formed
    Malformed(String),
}

impl fmt::Display for MemberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberError::Bind { addr, source } => {
                write!(f, "Bind error on {}: {}", addr, source)
            }
            MemberError::Frame(msg) => write!(f, "Frame error: {}", msg),
            MemberError::Decode(err) => write!(f, "Decode error: {}", err),
            MemberError::Encode(err) => write!(f, "Encode error: {}", err),
            MemberError::Io(err) => write!(f, "I/O error: {}", err),
            MemberError::Interrupted(msg) => write!(f, "Interrupted: {}", msg),
            MemberError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MemberError::Lifecycle(msg) => write!(f, "Lifecycle error: {}", msg),
            MemberError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
            MemberError::Shutdown(errors) => {
                write!(f, "Shutdown incomplete ({} failures)", errors.len())?;
                for err in errors {
                    write!(f, "; {}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Gossip(err) => write!(f, "gossip message: {}", err),
            DecodeError::Envelope(err) => write!(f, "envelope: {}", err),
            DecodeError::Malformed(msg) => write!(f, "malformed payload: {}", msg),
        }
    }
}

impl std::error::Error for MemberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemberError::Bind { source, .. } => Some(source),
            MemberError::Io(err) => Some(err),
            MemberError::Decode(err) => Some(err),
            MemberError::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Gossip(err) => Some(err),
            DecodeError::Envelope(err) => Some(err),
            DecodeError::Malformed(_) => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, MemberError>;

impl MemberError {
    /// Get the error type identifier
    pub fn kind(&self) -> &'static str {
        match self {
            MemberError::Bind { .. } => "bind_error",
            MemberError::Frame(_) => "frame_error",
            MemberError::Decode(_) => "decode_error",
            MemberError::Encode(_) => "encode_error",
            MemberError::Io(_) => "io_error",
            MemberError::Interrupted(_) => "interrupted_error",
            MemberError::Config(_) => "configuration_error",
            MemberError::Lifecycle(_) => "lifecycle_error",
            MemberError::Concurrency(_) => "concurrency_error",
            MemberError::Shutdown(_) => "shutdown_error",
        }
    }
}

impl From<std::io::Error> for MemberError {
    fn from(err: std::io::Error) -> Self {
        MemberError::Io(err)
    }
}

impl From<DecodeError> for MemberError {
    fn from(err: DecodeError) -> Self {
        MemberError::Decode(err)
    }
}

impl From<bincode::error::EncodeError> for MemberError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MemberError::Encode(err)
    }
}

impl From<std::net::AddrParseError> for MemberError {
    fn from(err: std::net::AddrParseError) -> Self {
        MemberError::Config(format!("Invalid address: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::MemberError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemberError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! lifecycle_error {
    ($msg:expr) => {
        $crate::error::MemberError::Lifecycle($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemberError::Lifecycle(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! frame_error {
    ($msg:expr) => {
        $crate::error::MemberError::Frame($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemberError::Frame(format!($fmt, $($arg)*))
    };
}
